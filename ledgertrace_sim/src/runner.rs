//! Scenario runner - executes simulation scenarios and checks their outcome.

use crate::ledger::LedgerStats;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld, WorldStats};

use ledgertrace_core::{
    start_root, AgentRecord, NotificationRecord, ParticipantState, Reader, SecurityToolBox, TraceError,
    Writer,
};
use ledgertrace_env::{LedgerProvider, TraceContext};
use serde::Serialize;
use tracing::{info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub world: WorldStats,
    pub ledger: LedgerStats,

    /// Agents in each state at the end of the run
    pub normal: usize,
    pub infected: usize,
    pub notified: usize,
    pub quarantined: usize,

    /// Hostile records placed on the notification log
    pub forged_records: u64,

    /// Agent records rewritten in ledger storage
    pub tampered_records: u64,
}

/// Hostile activity injected by a scenario.
#[derive(Debug, Clone, Copy, Default)]
struct Interference {
    forged: u64,
    tampered: u64,
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner with default world parameters.
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self::from_config(SimConfig {
            seed,
            num_agents,
            ..Default::default()
        })
    }

    /// Creates a runner from a full configuration.
    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.config.max_duration_secs = secs;
        self
    }

    pub fn with_diagnosticians(mut self, count: usize) -> Self {
        self.config.num_diagnosticians = count;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        info!("  {}", scenario.description());

        let mut world = match SimWorld::new(self.config.clone()) {
            Ok(world) => world,
            Err(e) => return self.failed(scenario, format!("world setup failed: {}", e)),
        };

        let outcome = match scenario {
            ScenarioId::Outbreak => self.run_outbreak(&mut world).await,
            ScenarioId::FlakyLedger => self.run_flaky_ledger(&mut world).await,
            ScenarioId::Forgery => self.run_forgery(&mut world).await,
        };

        let interference = match &outcome {
            Ok(interference) => *interference,
            Err(_) => Interference::default(),
        };
        let metrics = collect_metrics(&world, interference);

        let failure_reason = match outcome {
            Err(e) => Some(format!("fatal error: {}", e)),
            Ok(_) => {
                let mut violations = world.invariant_violations();
                violations.extend(self.assertions(scenario, &world, &metrics).await);
                if violations.is_empty() {
                    None
                } else {
                    Some(violations.join("; "))
                }
            }
        };

        ScenarioResult {
            scenario,
            seed: self.config.seed,
            passed: failure_reason.is_none(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            failure_reason,
            metrics,
        }
    }

    /// LT-001: Outbreak - baseline run over a healthy ledger.
    async fn run_outbreak(&self, world: &mut SimWorld) -> Result<Interference, TraceError> {
        world.run().await?;
        Ok(Interference::default())
    }

    /// LT-002: FlakyLedger - every ledger fault at once, healed at the end.
    async fn run_flaky_ledger(&self, world: &mut SimWorld) -> Result<Interference, TraceError> {
        let controller = world.ledger().controller().clone();
        controller.set_publish_failure_rate(0.2);
        controller.set_drop_ack_rate(0.1);
        controller.set_fetch_failure_rate(0.001);
        controller.fail_next(3);

        world.run().await?;

        controller.heal();
        Ok(Interference::default())
    }

    /// LT-003: Forgery - hostile records interleaved with the solver's output,
    /// and agent logs rewritten before anyone has checked in.
    async fn run_forgery(&self, world: &mut SimWorld) -> Result<Interference, TraceError> {
        let forger = SecurityToolBox::from_signing_key(world.context.derive_signing_key(0xbad));
        let every = (self.config.solver_interval_ms / self.config.tick_ms).max(1);
        let mut interference = Interference::default();

        while world.time() < self.config.max_duration_secs {
            world.tick().await?;
            if world.tick_count() % every == every / 2 {
                if interference.forged == 0 {
                    interference.tampered = tamper_agent_logs(world).await?;
                }
                interference.forged += inject_forgeries(world, &forger).await?;
            }
        }
        Ok(interference)
    }

    /// Scenario-specific pass conditions.
    async fn assertions(&self, scenario: ScenarioId, world: &SimWorld, metrics: &ScenarioMetrics) -> Vec<String> {
        let mut failures = Vec::new();
        let stats = &metrics.world;

        match scenario {
            ScenarioId::Outbreak => {
                if stats.check_ins == 0 {
                    failures.push("no infected agent checked in".to_string());
                }
                if stats.failed_writes > 0 || stats.failed_scans > 0 {
                    failures.push("ledger operations failed on a healthy ledger".to_string());
                }
            }
            ScenarioId::FlakyLedger => {
                if metrics.ledger.dropped_acks == 0 || metrics.ledger.failed_publishes == 0 {
                    failures.push("fault injection never triggered".to_string());
                }
                failures.extend(audit_agent_logs(world).await);
            }
            ScenarioId::Forgery => {
                if metrics.forged_records == 0 {
                    failures.push("no forged records were injected".to_string());
                }
                if stats.scans_rejected == 0 || stats.scans_undecodable == 0 {
                    failures.push(format!(
                        "forged records went unnoticed (rejected={}, undecodable={})",
                        stats.scans_rejected, stats.scans_undecodable
                    ));
                }
                if stats.check_ins > 0 && stats.bundle_rejections == 0 {
                    failures.push("rewritten agent records were bundled".to_string());
                }
            }
        }
        failures
    }

    fn failed(&self, scenario: ScenarioId, reason: String) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.config.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

fn collect_metrics(world: &SimWorld, interference: Interference) -> ScenarioMetrics {
    ScenarioMetrics {
        world: world.stats().clone(),
        ledger: world.ledger().controller().stats(),
        normal: world.count(ParticipantState::Normal),
        infected: world.count(ParticipantState::Infected),
        notified: world.count(ParticipantState::Notified),
        quarantined: world.count(ParticipantState::Quarantined),
        forged_records: interference.forged,
        tampered_records: interference.tampered,
    }
}

/// Flips a signature byte in the first record of every agent log whose
/// owner has not checked in yet, rewriting it in place.
async fn tamper_agent_logs(world: &SimWorld) -> Result<u64, TraceError> {
    let storage = world.ledger().storage();
    let mut tampered = 0;

    for (agent, seed) in world.agents().iter().zip(world.orchestrator().agent_seeds()) {
        if agent.checked_in {
            continue;
        }
        let root = start_root(&seed);
        let Some(bytes) = storage.fetch(&root).await? else {
            continue;
        };
        let mut record: AgentRecord = serde_json::from_slice(&bytes)?;
        if let Some(byte) = record.checksum.signature.0.first_mut() {
            *byte ^= 0x01;
        }
        if storage.tamper(&root, serde_json::to_vec(&record)?) {
            tampered += 1;
        }
    }

    info!("Rewrote {} agent records in ledger storage", tampered);
    Ok(tampered)
}

/// Appends an impostor record, a corrupted record and garbage to the notification log.
async fn inject_forgeries(world: &SimWorld, forger: &SecurityToolBox) -> Result<u64, TraceError> {
    let orchestrator = world.orchestrator();
    let victims: Vec<String> = world
        .agents()
        .iter()
        .map(|a| a.participant.id().to_string())
        .collect();

    let mut writer = Writer::multi_writer(
        orchestrator.provider().clone(),
        orchestrator.notification_seed().clone(),
    );
    writer.sync().await?;

    let impostor = NotificationRecord::seal(forger, victims.clone())?;
    writer.publish(&impostor).await?;

    let mut corrupted = NotificationRecord::seal(forger, victims)?;
    if let Some(byte) = corrupted.checksum.signature.0.first_mut() {
        *byte ^= 0x01;
    }
    writer.publish(&corrupted).await?;

    writer.publish_bytes(br#"{"possible":"everyone"}"#.to_vec()).await?;
    Ok(3)
}

/// Re-reads every agent log: each record must verify and no retry may
/// have left the same payload twice.
async fn audit_agent_logs(world: &SimWorld) -> Vec<String> {
    let orchestrator = world.orchestrator();
    let mut failures = Vec::new();
    let mut total = 0u64;

    for (i, seed) in orchestrator.agent_seeds().into_iter().enumerate() {
        let key = match orchestrator.agent_public_key(i) {
            Ok(key) => key,
            Err(e) => {
                failures.push(e.to_string());
                continue;
            }
        };
        let records: Vec<AgentRecord> = match Reader::new(orchestrator.provider().clone(), seed).read().await {
            Ok(records) => records,
            Err(e) => {
                failures.push(format!("agent {} log unreadable: {}", i, e));
                continue;
            }
        };

        if records.iter().any(|r| !r.checksum.verify_from(&key)) {
            failures.push(format!("agent {} log holds unverifiable records", i));
        }
        if records.windows(2).any(|w| w[0] == w[1]) {
            failures.push(format!("agent {} log holds a duplicated record", i));
        }
        total += records.len() as u64;
    }

    let confirmed = world.stats().writes + world.stats().check_ins;
    if total < confirmed {
        warn!("Agent logs hold {} records, {} writes were confirmed", total, confirmed);
        failures.push(format!("{} confirmed writes missing from the ledger", confirmed - total));
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgertrace_core::Snapshot;

    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::from_config(SimConfig {
            seed,
            num_agents: 10,
            num_diagnosticians: 1,
            max_duration_secs: 240.0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_outbreak_scenario() {
        let result = runner(42).run(ScenarioId::Outbreak).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.world.check_ins >= 1);
        assert_eq!(result.total_ticks, 240);
    }

    #[tokio::test]
    async fn test_flaky_ledger_scenario() {
        let result = runner(42).run(ScenarioId::FlakyLedger).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.ledger.dropped_acks > 0);
    }

    #[tokio::test]
    async fn test_forgery_scenario() {
        let result = runner(42).run(ScenarioId::Forgery).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.forged_records > 0);
        assert!(result.metrics.world.scans_rejected > 0);
        assert!(result.metrics.tampered_records > 0);
        assert!(result.metrics.world.check_ins > 0);
        assert!(result.metrics.world.bundle_rejections > 0);
    }

    #[tokio::test]
    async fn test_rewritten_agent_record_is_not_bundled() {
        let mut world = SimWorld::new(SimConfig {
            num_agents: 3,
            num_diagnosticians: 1,
            initial_infected: 0,
            ..Default::default()
        })
        .unwrap();
        world.tick().await.unwrap();
        assert_eq!(world.stats().writes, 3);

        assert_eq!(tamper_agent_logs(&world).await.unwrap(), 3);

        let snapshot = Snapshot {
            id: world.agents()[0].participant.id().to_string(),
            history: Vec::new(),
        };
        let report = world
            .orchestrator()
            .diagnostician_aggregate(0, 0, &snapshot)
            .await
            .unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.bundled, 1);
    }

    #[tokio::test]
    async fn test_outbreak_deterministic() {
        let a = runner(9).run(ScenarioId::Outbreak).await;
        let b = runner(9).run(ScenarioId::Outbreak).await;
        assert_eq!(a.metrics.world, b.metrics.world);
        assert_eq!(a.passed, b.passed);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_cleanly() {
        let result = ScenarioRunner::new(1, 0).run(ScenarioId::Outbreak).await;
        assert!(!result.passed);
        assert!(result.failure_reason.unwrap().contains("world setup failed"));
    }
}
