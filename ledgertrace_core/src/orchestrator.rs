//! Orchestrator - owns every participant channel and drives the protocol.
//!
//! This module is the integration layer between the pure pieces
//! (security, channels, records, state machine) and the environment
//! abstraction (`TraceContext` + `LedgerProvider`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │                  ChannelRegistry                     │   │
//! │  │  agent i        → Writer, notification Reader, keys  │   │
//! │  │  diagnostician j → Writer, keys                      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │        │ agent_write        │ diagnostician_aggregate       │
//! │        ▼                    ▼                               │
//! │   agent log            diagnostician log ──► solver          │
//! │                                               │             │
//! │   notification_scan ◄──── notification log ◄──┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each channel's Writer sits behind its own async mutex, so writes on one
//! channel are strictly sequential while different participants proceed
//! in parallel without sharing a lock.

use crate::channel::{ChannelRole, Reader, Seed, Writer};
use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::participant::Participant;
use crate::protocol::{
    fold_notifications, AgentRecord, AggregateRecord, Authenticated, NotificationRecord,
    NotificationScan, Snapshot,
};
use crate::security::{PublicKey, SecurityToolBox};
use ledgertrace_env::{Address, LedgerProvider, TraceContext};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Channels and identity of one agent.
pub struct AgentChannels {
    pub writer: Mutex<Writer>,
    /// Private cursor onto the shared notification log
    pub notifications: Mutex<Reader>,
    pub security: SecurityToolBox,
    pub seed: Seed,
}

/// Channel and identity of one diagnostician.
pub struct DiagnosticianChannels {
    pub writer: Mutex<Writer>,
    pub security: SecurityToolBox,
    pub seed: Seed,
}

/// Registry of every participant channel, indexed by participant number.
#[derive(Default)]
pub struct ChannelRegistry {
    agents: Vec<AgentChannels>,
    diagnosticians: Vec<DiagnosticianChannels>,
}

impl ChannelRegistry {
    pub fn agent(&self, index: usize) -> Result<&AgentChannels, TraceError> {
        self.agents
            .get(index)
            .ok_or(TraceError::UnknownParticipant { role: "agent", index })
    }

    pub fn diagnostician(&self, index: usize) -> Result<&DiagnosticianChannels, TraceError> {
        self.diagnosticians
            .get(index)
            .ok_or(TraceError::UnknownParticipant { role: "diagnostician", index })
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn diagnostician_count(&self) -> usize {
        self.diagnosticians.len()
    }
}

/// Result of a check-in escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    /// Root of the aggregate record on the diagnostician's log
    pub address: Address,

    /// Agent histories included in the bundle
    pub bundled: usize,

    /// Agent records dropped because their checksum did not verify
    pub rejected: usize,
}

/// Drives writes, check-ins and notification scans for all participants.
pub struct Orchestrator<Ctx: TraceContext> {
    provider: Arc<dyn LedgerProvider>,
    context: Arc<Ctx>,
    config: TraceConfig,
    /// Recipient of every encrypted history
    authority: PublicKey,
    notification_seed: Seed,
    registry: ChannelRegistry,
}

impl<Ctx: TraceContext> Orchestrator<Ctx> {
    /// Creates an orchestrator with an empty registry.
    pub fn new(
        provider: Arc<dyn LedgerProvider>,
        context: Arc<Ctx>,
        config: TraceConfig,
        authority: PublicKey,
    ) -> Self {
        let notification_seed = Seed::derive(&config.namespace, ChannelRole::Notifier, 0);
        Self {
            provider,
            context,
            config,
            authority,
            notification_seed,
            registry: ChannelRegistry::default(),
        }
    }

    /// Creates one channel and identity per agent and per diagnostician.
    pub fn initialize_channels(&mut self, agent_count: usize, diagnostician_count: usize) {
        let namespace = self.config.namespace.clone();

        let agents = (0..agent_count)
            .map(|i| {
                let seed = Seed::derive(&namespace, ChannelRole::Agent, i);
                let key = self.context.derive_signing_key((1u64 << 32) | i as u64);
                AgentChannels {
                    writer: Mutex::new(Writer::new(self.provider.clone(), seed.clone())),
                    notifications: Mutex::new(Reader::new(
                        self.provider.clone(),
                        self.notification_seed.clone(),
                    )),
                    security: SecurityToolBox::from_signing_key(key),
                    seed,
                }
            })
            .collect::<Vec<_>>();

        let diagnosticians = (0..diagnostician_count)
            .map(|i| {
                let seed = Seed::derive(&namespace, ChannelRole::Diagnostician, i);
                let key = self.context.derive_signing_key((2u64 << 32) | i as u64);
                DiagnosticianChannels {
                    writer: Mutex::new(Writer::new(self.provider.clone(), seed.clone())),
                    security: SecurityToolBox::from_signing_key(key),
                    seed,
                }
            })
            .collect::<Vec<_>>();

        info!(
            "Agents' roots: {:?}",
            agents.iter().map(|a| crate::channel::start_root(&a.seed).to_string()).collect::<Vec<_>>()
        );
        info!(
            "Diagnosticians' roots: {:?}",
            diagnosticians.iter().map(|d| crate::channel::start_root(&d.seed).to_string()).collect::<Vec<_>>()
        );

        self.registry = ChannelRegistry {
            agents,
            diagnosticians,
        };
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn provider(&self) -> &Arc<dyn LedgerProvider> {
        &self.provider
    }

    pub fn authority(&self) -> &PublicKey {
        &self.authority
    }

    /// Seed of the shared notification log.
    pub fn notification_seed(&self) -> &Seed {
        &self.notification_seed
    }

    pub fn agent_seeds(&self) -> Vec<Seed> {
        self.registry.agents.iter().map(|a| a.seed.clone()).collect()
    }

    pub fn diagnostician_seeds(&self) -> Vec<Seed> {
        self.registry.diagnosticians.iter().map(|d| d.seed.clone()).collect()
    }

    pub fn agent_public_key(&self, index: usize) -> Result<PublicKey, TraceError> {
        Ok(self.registry.agent(index)?.security.public_key())
    }

    pub fn diagnostician_public_key(&self, index: usize) -> Result<PublicKey, TraceError> {
        Ok(self.registry.diagnostician(index)?.security.public_key())
    }

    /// Seals and publishes an agent record, bypassing the throttle.
    pub async fn agent_write(&self, agent_index: usize, snapshot: &Snapshot) -> Result<Address, TraceError> {
        let agent = self.registry.agent(agent_index)?;
        let record = AgentRecord::seal(&agent.security, snapshot, &self.authority)?;
        let address = self.publish_with_retry(&agent.writer, &record).await?;
        debug!("Agent {} wrote {} samples at {}", agent_index, snapshot.history.len(), address);
        Ok(address)
    }

    /// Periodic write trigger: publishes only if the participant's throttle allows.
    pub async fn periodic_write(
        &self,
        agent_index: usize,
        participant: &mut Participant,
        snapshot: &Snapshot,
    ) -> Result<Option<Address>, TraceError> {
        let now = self.context.now();
        if !participant.should_write(now) {
            return Ok(None);
        }
        let address = self.agent_write(agent_index, snapshot).await?;
        participant.record_write(now);
        Ok(Some(address))
    }

    /// Check-in escalation.
    ///
    /// Forces an agent write, audits the agent's whole log through a fresh
    /// Reader, and has the diagnostician publish one aggregate record
    /// (histories only, no bare identifier) on its own log.
    pub async fn diagnostician_aggregate(
        &self,
        agent_index: usize,
        diagnostician_index: usize,
        snapshot: &Snapshot,
    ) -> Result<AggregateReport, TraceError> {
        let agent = self.registry.agent(agent_index)?;
        let diagnostician = self.registry.diagnostician(diagnostician_index)?;

        self.agent_write(agent_index, snapshot).await?;

        let reader = Reader::new(self.provider.clone(), agent.seed.clone());
        let records: Vec<AgentRecord> = reader.read().await?;

        let agent_key = agent.security.public_key();
        let mut rejected = 0;
        let mut bundle = Vec::with_capacity(records.len());
        for record in records {
            if record.agent_public_key == agent_key && record.checksum.verify_from(&agent_key) {
                bundle.push(record.history);
            } else {
                warn!(
                    "CHECKSUM ERROR on agent {} log (claimed author {})",
                    agent_index,
                    record.author()
                );
                rejected += 1;
            }
        }

        let bundled = bundle.len();
        let aggregate = AggregateRecord::seal(&diagnostician.security, bundle, agent_key)?;
        let address = self.publish_with_retry(&diagnostician.writer, &aggregate).await?;

        info!(
            "Diagnostician {} aggregated {} records of agent {} at {}",
            diagnostician_index, bundled, agent_index, address
        );

        Ok(AggregateReport {
            address,
            bundled,
            rejected,
        })
    }

    /// Reads unread notification records for one agent and folds the verified ones.
    pub async fn notification_scan(&self, agent_index: usize) -> Result<NotificationScan, TraceError> {
        let agent = self.registry.agent(agent_index)?;
        let mut reader = agent.notifications.lock().await;
        let previous_root = reader.cursor().clone();
        let batch = reader.read_new::<NotificationRecord>().await?;

        let trusted = &self.config.trusted_notifiers;
        for (address, record) in &batch.records {
            if let Err(e) = record.authenticate() {
                warn!("CHECKSUM ERROR at {} (scan from {}): {}", address, previous_root, e);
            } else if !trusted.is_empty() && !trusted.contains(&record.author()) {
                warn!(
                    "Discarding notification at {} from untrusted author {}",
                    address,
                    record.author()
                );
            }
        }

        let mut scan = fold_notifications(
            batch.records.iter().map(|(_, r)| r),
            trusted,
        );
        scan.undecodable = batch.undecodable;

        if !scan.is_quiet() {
            debug!(
                "Agent {} scan: {} verified, {} rejected, {} possible",
                agent_index,
                scan.verified,
                scan.rejected,
                scan.possible.len()
            );
        }
        Ok(scan)
    }

    /// Publishes on a serialized writer, retrying transient ledger failures.
    async fn publish_with_retry<T: Serialize>(
        &self,
        writer: &Mutex<Writer>,
        record: &T,
    ) -> Result<Address, TraceError> {
        let mut writer = writer.lock().await;
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match writer.publish(record).await {
                Ok(address) => return Ok(address),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "Publish on {} failed (attempt {}/{}): {}; retrying in {:?}",
                        writer.seed(),
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    self.context.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
