//! Proximity solver - the analysis authority of the simulation.
//!
//! Consumes aggregate records from every diagnostician log, decrypts the
//! bundled histories of confirmed cases, and compares them against every
//! agent's published history. Agents that were within `radius` of a
//! confirmed case inside the contact window are published as `possible`
//! on the shared notification log.

use crate::context::SimContext;

use ledgertrace_core::{
    AgentRecord, AggregateRecord, NotificationRecord, PublicKey, Reader, RetryPolicy, Sample,
    SecurityToolBox, Seed, TraceError, Writer,
};
use ledgertrace_env::{Address, LedgerProvider, TraceContext};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A diagnostician log the solver follows.
struct DiagnosticianFeed {
    reader: Reader,
    key: PublicKey,
}

/// An agent log the solver can audit.
#[derive(Debug, Clone)]
pub struct AgentDirectory {
    pub seed: Seed,
    pub key: PublicKey,
}

/// Outcome of one solver pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverReport {
    /// Aggregate records accepted this pass
    pub aggregates: usize,

    /// Aggregate records whose checksum did not match the diagnostician
    pub rejected: usize,

    /// Identifiers newly flagged this pass
    pub flagged: Vec<String>,

    /// Root of the notification record, if one was published
    pub published: Option<Address>,
}

pub struct ProximitySolver {
    security: SecurityToolBox,
    context: Arc<SimContext>,
    provider: Arc<dyn LedgerProvider>,
    diagnosticians: Vec<DiagnosticianFeed>,
    agents: Vec<AgentDirectory>,
    notifications: Writer,
    radius: f64,
    window_ms: u64,
    retry: RetryPolicy,
    /// Confirmed cases (by agent key) with every decrypted sample
    cases: Vec<(PublicKey, Vec<Sample>)>,
    /// Cases arrived since the last successful contact match
    unmatched: bool,
    /// Flagged but not yet published (survives publish failures)
    pending: BTreeSet<String>,
    notified: HashSet<String>,
    /// Every identifier ever signed into a record, landed or not
    signed: HashSet<String>,
}

impl ProximitySolver {
    pub fn new(
        security: SecurityToolBox,
        context: Arc<SimContext>,
        provider: Arc<dyn LedgerProvider>,
        diagnosticians: Vec<(Seed, PublicKey)>,
        agents: Vec<AgentDirectory>,
        notification_seed: Seed,
        radius: f64,
        window_ms: u64,
    ) -> Self {
        let diagnosticians = diagnosticians
            .into_iter()
            .map(|(seed, key)| DiagnosticianFeed {
                reader: Reader::new(provider.clone(), seed),
                key,
            })
            .collect();

        Self {
            notifications: Writer::multi_writer(provider.clone(), notification_seed),
            security,
            context,
            provider,
            diagnosticians,
            agents,
            radius,
            window_ms,
            retry: RetryPolicy::default(),
            cases: Vec::new(),
            unmatched: false,
            pending: BTreeSet::new(),
            notified: HashSet::new(),
            signed: HashSet::new(),
        }
    }

    /// Sets how often, and with what backoff, a failed agent-log read is
    /// attempted per pass.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.security.public_key()
    }

    /// Identifiers whose notification publish was confirmed.
    pub fn notified(&self) -> &HashSet<String> {
        &self.notified
    }

    /// Identifiers this solver has signed into any notification record.
    pub fn signed(&self) -> &HashSet<String> {
        &self.signed
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Runs one pass: ingest new aggregates, match contacts, publish.
    pub async fn run(&mut self) -> Result<SolverReport, TraceError> {
        let mut report = SolverReport::default();

        for feed in &mut self.diagnosticians {
            let batch = feed.reader.read_new::<AggregateRecord>().await?;
            for (address, aggregate) in batch.records {
                if !aggregate.checksum.verify_from(&feed.key) {
                    warn!("CHECKSUM ERROR on aggregate at {}", address);
                    report.rejected += 1;
                    continue;
                }
                match aggregate.open_bundle(&self.security) {
                    Ok(samples) => {
                        report.aggregates += 1;
                        self.unmatched = true;
                        merge_case(&mut self.cases, aggregate.agent_public_key, samples);
                    }
                    Err(e) => warn!("Unreadable bundle at {}: {}", address, e),
                }
            }
        }

        if self.unmatched {
            let flagged = self.match_contacts().await?;
            self.unmatched = false;
            for id in flagged {
                if !self.notified.contains(&id) && self.pending.insert(id.clone()) {
                    report.flagged.push(id);
                }
            }
        }

        if !self.pending.is_empty() {
            report.published = Some(self.publish_pending().await?);
        }

        Ok(report)
    }

    /// Reads every non-case agent log and returns identifiers in contact with a case.
    async fn match_contacts(&self) -> Result<BTreeSet<String>, TraceError> {
        let radius_sq = self.radius * self.radius;
        let mut flagged = BTreeSet::new();

        for agent in &self.agents {
            if self.cases.iter().any(|(key, _)| key == &agent.key) {
                continue;
            }

            let records = self.read_agent_log(agent).await?;

            for record in records {
                if record.agent_public_key != agent.key || !record.checksum.verify_from(&agent.key) {
                    warn!("CHECKSUM ERROR on agent log {}", agent.seed);
                    continue;
                }
                let history = match record.open_history(&self.security) {
                    Ok(history) => history,
                    Err(e) => {
                        warn!("Unreadable history on agent log {}: {}", agent.seed, e);
                        continue;
                    }
                };
                if self.in_contact(&history, radius_sq) {
                    flagged.insert(record.id.clone());
                    break;
                }
            }
        }

        debug!("Contact matching flagged {} agents", flagged.len());
        Ok(flagged)
    }

    async fn read_agent_log(&self, agent: &AgentDirectory) -> Result<Vec<AgentRecord>, TraceError> {
        let reader = Reader::new(self.provider.clone(), agent.seed.clone());
        let mut attempt = 1;
        loop {
            match reader.read().await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    debug!(
                        "Read of agent log {} failed (attempt {}), retrying in {:?}: {}",
                        agent.seed, attempt, backoff, e
                    );
                    self.context.sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn in_contact(&self, history: &[Sample], radius_sq: f64) -> bool {
        history.iter().any(|s| {
            self.cases.iter().flat_map(|(_, samples)| samples).any(|c| {
                s.at_ms.abs_diff(c.at_ms) <= self.window_ms && s.distance_sq(c) <= radius_sq
            })
        })
    }

    async fn publish_pending(&mut self) -> Result<Address, TraceError> {
        let possible: Vec<String> = self.pending.iter().cloned().collect();
        let record = NotificationRecord::seal(&self.security, possible)?;
        self.signed.extend(self.pending.iter().cloned());

        self.notifications.sync().await?;
        let address = self.notifications.publish(&record).await?;

        info!("Solver published {} possible infections at {}", self.pending.len(), address);
        self.notified.extend(std::mem::take(&mut self.pending));
        Ok(address)
    }
}

fn merge_case(cases: &mut Vec<(PublicKey, Vec<Sample>)>, key: PublicKey, samples: Vec<Sample>) {
    match cases.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => existing.extend(samples),
        None => cases.push((key, samples)),
    }
}
