//! SimWorld - the simulation harness container.
//!
//! One tick of the world:
//!
//! ```text
//! advance clock ─► move agents ─► exposure checks ─► periodic writes
//!                                                        │
//!            notification scans ◄── solver pass ◄── check-ins
//!            (JoinSet, every solver interval)
//! ```

use crate::context::SimContext;
use crate::error::SimError;
use crate::ledger::{SimLedger, SimLedgerController};
use crate::solver::{AgentDirectory, ProximitySolver};

use ledgertrace_core::{
    NotificationScan, Orchestrator, Participant, ParticipantState, Sample, SecurityToolBox, Snapshot,
    TraceConfig, TraceError, Transition,
};
use ledgertrace_env::TraceContext;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    pub num_agents: usize,
    pub num_diagnosticians: usize,

    /// Side of the square world
    pub world_size: f64,

    /// Side of the square care centre at the middle of the world
    pub centre_size: f64,

    pub tick_ms: u64,
    pub max_duration_secs: f64,

    /// Agents infected at t=0
    pub initial_infected: usize,

    pub infection_radius: f64,

    /// Acceptance probability per nearby infected agent per tick
    pub infection_probability: f64,

    /// Distance covered per tick
    pub velocity: f64,

    /// Chance per tick that an idle agent picks a new destination
    pub new_target_probability: f64,

    /// Time from infection until the agent heads for a check-in
    pub symptom_delay_ms: u64,

    pub solver_interval_ms: u64,

    /// Two samples closer in time than this can be a contact
    pub contact_window_ms: u64,

    /// Protocol configuration shared by every participant
    pub trace: TraceConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_agents: 30,
            num_diagnosticians: 2,
            world_size: 400.0,
            centre_size: 60.0,
            tick_ms: 1_000,
            max_duration_secs: 600.0,
            initial_infected: 2,
            infection_radius: 12.0,
            infection_probability: 0.3,
            velocity: 6.0,
            new_target_probability: 0.05,
            symptom_delay_ms: 60_000,
            solver_interval_ms: 30_000,
            contact_window_ms: 10_000,
            trace: TraceConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.num_agents == 0 {
            return Err(SimError::Config("at least one agent is required".into()));
        }
        if self.initial_infected > self.num_agents {
            return Err(SimError::Config(format!(
                "{} initial infections for {} agents",
                self.initial_infected, self.num_agents
            )));
        }
        if self.tick_ms == 0 {
            return Err(SimError::Config("tick_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.infection_probability)
            || !(0.0..=1.0).contains(&self.new_target_probability)
        {
            return Err(SimError::Config("probabilities must lie in [0, 1]".into()));
        }
        if self.centre_size <= 0.0 || self.centre_size > self.world_size {
            return Err(SimError::Config("care centre must fit inside the world".into()));
        }
        Ok(())
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorldStats {
    pub writes: u64,
    pub failed_writes: u64,
    pub check_ins: u64,
    pub failed_check_ins: u64,
    /// Agent records a diagnostician refused to bundle
    pub bundle_rejections: u64,
    pub solver_runs: u64,
    pub failed_solver_runs: u64,
    pub notifications_published: u64,
    pub scans_verified: u64,
    pub scans_rejected: u64,
    pub scans_undecodable: u64,
    pub failed_scans: u64,
    pub infections: u64,
    pub notified: u64,
    pub admitted: u64,
}

/// A participant plus its body in the world.
pub struct SimAgent {
    pub participant: Participant,
    pub x: f64,
    pub y: f64,
    target: Option<(f64, f64)>,
    /// Samples not yet published
    pending: Vec<Sample>,
    /// Reported to a diagnostician and isolated at the centre
    pub checked_in: bool,
}

impl SimAgent {
    fn step(&mut self, velocity: f64) {
        if let Some((tx, ty)) = self.target {
            let dx = tx - self.x;
            let dy = ty - self.y;
            let length = (dx * dx + dy * dy).sqrt();
            if length <= velocity {
                self.x = tx;
                self.y = ty;
                self.target = None;
            } else {
                self.x += dx * velocity / length;
                self.y += dy * velocity / length;
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.participant.id().to_string(),
            history: self.pending.clone(),
        }
    }
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    ledger: SimLedger,
    orchestrator: Arc<Orchestrator<SimContext>>,
    solver: ProximitySolver,
    agents: Vec<SimAgent>,

    /// Movement and exposure randomness
    rng: ChaCha8Rng,

    tick_count: u64,
    last_solver_run: Duration,
    stats: WorldStats,
}

impl SimWorld {
    /// Creates a world, registers every channel and places the agents.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;

        let context = SimContext::shared(config.seed);
        let controller = Arc::new(SimLedgerController::new(context.rng_stream(2)));
        let ledger = SimLedger::new(controller);

        // The solver is the analysis authority and the only trusted notifier
        let solver_security = SecurityToolBox::from_signing_key(context.derive_signing_key(3u64 << 32));
        let authority = solver_security.public_key();
        let mut trace = config.trace.clone();
        if trace.trusted_notifiers.is_empty() {
            trace.trusted_notifiers.push(authority);
        }

        let mut orchestrator = Orchestrator::new(
            Arc::new(ledger.clone()),
            context.clone(),
            trace.clone(),
            authority,
        );
        orchestrator.initialize_channels(config.num_agents, config.num_diagnosticians);

        let directory = orchestrator
            .agent_seeds()
            .into_iter()
            .enumerate()
            .map(|(i, seed)| {
                Ok(AgentDirectory {
                    seed,
                    key: orchestrator.agent_public_key(i)?,
                })
            })
            .collect::<Result<Vec<_>, TraceError>>()?;
        let diagnosticians = orchestrator
            .diagnostician_seeds()
            .into_iter()
            .enumerate()
            .map(|(i, seed)| Ok((seed, orchestrator.diagnostician_public_key(i)?)))
            .collect::<Result<Vec<_>, TraceError>>()?;

        let solver = ProximitySolver::new(
            solver_security,
            context.clone(),
            Arc::new(ledger.clone()),
            diagnosticians,
            directory,
            orchestrator.notification_seed().clone(),
            config.infection_radius,
            config.contact_window_ms,
        )
        .with_retry(trace.retry.clone());

        let mut rng = context.rng_stream(1);
        let interval = trace.min_write_interval();
        let agents = (0..config.num_agents)
            .map(|i| {
                let mut participant = Participant::new(format!("agent-{}", i), i, interval);
                if i < config.initial_infected {
                    participant = participant.seeded_infection(Duration::ZERO);
                }
                SimAgent {
                    participant,
                    x: rng.gen_range(0.0..config.world_size),
                    y: rng.gen_range(0.0..config.world_size),
                    target: None,
                    pending: Vec::new(),
                    checked_in: false,
                }
            })
            .collect();

        info!(
            "World ready: {} agents, {} diagnosticians, {} initially infected",
            config.num_agents, config.num_diagnosticians, config.initial_infected
        );

        Ok(Self {
            config,
            context,
            ledger,
            orchestrator: Arc::new(orchestrator),
            solver,
            agents,
            rng,
            tick_count: 0,
            last_solver_run: Duration::ZERO,
            stats: WorldStats::default(),
        })
    }

    /// Advances the simulation by one tick.
    ///
    /// Ledger failures are logged and retried on a later tick; only fatal
    /// protocol errors abort the run.
    pub async fn tick(&mut self) -> Result<(), TraceError> {
        self.context.advance_time(Duration::from_millis(self.config.tick_ms));
        self.tick_count += 1;
        let now = self.context.now();

        self.move_agents(now);
        self.spread_infection(now);
        self.periodic_writes(now).await?;
        self.check_ins(now).await?;

        if now.saturating_sub(self.last_solver_run) >= Duration::from_millis(self.config.solver_interval_ms) {
            self.last_solver_run = now;
            self.run_solver().await?;
            self.scan_notifications(now).await;
        }
        Ok(())
    }

    /// Runs ticks until the configured duration has elapsed.
    pub async fn run(&mut self) -> Result<(), TraceError> {
        while self.time() < self.config.max_duration_secs {
            self.tick().await?;
        }
        Ok(())
    }

    fn move_agents(&mut self, now: Duration) {
        let symptom_delay = Duration::from_millis(self.config.symptom_delay_ms);
        let centre = self.centre_bounds();

        for agent in &mut self.agents {
            match agent.participant.state() {
                ParticipantState::Quarantined => {}
                ParticipantState::Notified => {
                    if in_bounds(centre, agent.x, agent.y) {
                        if agent.participant.admit(now).is_some() {
                            debug!("{} admitted at the care centre", agent.participant.id());
                            self.stats.admitted += 1;
                        }
                    } else {
                        if agent.target.is_none() {
                            agent.target = Some(random_point(&mut self.rng, centre));
                        }
                        agent.step(self.config.velocity);
                    }
                }
                ParticipantState::Infected if agent.checked_in => {}
                ParticipantState::Infected
                    if agent
                        .participant
                        .medical()
                        .infection_date
                        .is_some_and(|d| now.saturating_sub(d) >= symptom_delay) =>
                {
                    if !in_bounds(centre, agent.x, agent.y) {
                        if !agent.target.is_some_and(|(x, y)| in_bounds(centre, x, y)) {
                            agent.target = Some(random_point(&mut self.rng, centre));
                        }
                        agent.step(self.config.velocity);
                    }
                }
                _ => {
                    agent.step(self.config.velocity);
                    if agent.target.is_none() && self.rng.gen::<f64>() < self.config.new_target_probability {
                        let world = (0.0, 0.0, self.config.world_size, self.config.world_size);
                        agent.target = Some(random_point(&mut self.rng, world));
                    }
                }
            }

            if agent.participant.state() != ParticipantState::Quarantined {
                agent.pending.push(Sample {
                    x: agent.x,
                    y: agent.y,
                    at_ms: now.as_millis() as u64,
                });
            }
        }
    }

    fn spread_infection(&mut self, now: Duration) {
        let reach = self.config.infection_radius * self.config.infection_radius;
        let sources: Vec<(f64, f64)> = self
            .agents
            .iter()
            .filter(|a| a.participant.is_infectious() && !a.checked_in)
            .map(|a| (a.x, a.y))
            .collect();

        for agent in &mut self.agents {
            if agent.participant.state() != ParticipantState::Normal {
                continue;
            }
            let nearby = sources
                .iter()
                .filter(|(x, y)| {
                    let dx = x - agent.x;
                    let dy = y - agent.y;
                    dx * dx + dy * dy <= reach
                })
                .count();
            if let Some(Transition::Infected) =
                agent
                    .participant
                    .expose(nearby, self.config.infection_probability, &mut self.rng, now)
            {
                debug!("{} infected at {:?}", agent.participant.id(), now);
                self.stats.infections += 1;
            }
        }
    }

    async fn periodic_writes(&mut self, now: Duration) -> Result<(), TraceError> {
        for (i, agent) in self.agents.iter_mut().enumerate() {
            if agent.participant.state() == ParticipantState::Quarantined || agent.pending.is_empty() {
                continue;
            }
            let snapshot = agent.snapshot();
            match self
                .orchestrator
                .periodic_write(i, &mut agent.participant, &snapshot)
                .await
            {
                Ok(Some(_)) => {
                    agent.pending.clear();
                    self.stats.writes += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Periodic write of {} failed at {:?}: {}", agent.participant.id(), now, e);
                    self.stats.failed_writes += 1;
                }
            }
        }
        Ok(())
    }

    async fn check_ins(&mut self, now: Duration) -> Result<(), TraceError> {
        let diagnosticians = self.config.num_diagnosticians;
        if diagnosticians == 0 {
            return Ok(());
        }
        let symptom_delay = Duration::from_millis(self.config.symptom_delay_ms);
        let centre = self.centre_bounds();

        for (i, agent) in self.agents.iter_mut().enumerate() {
            let symptomatic = agent.participant.state() == ParticipantState::Infected
                && agent
                    .participant
                    .medical()
                    .infection_date
                    .is_some_and(|d| now.saturating_sub(d) >= symptom_delay);
            if !symptomatic || agent.checked_in || !in_bounds(centre, agent.x, agent.y) {
                continue;
            }

            let snapshot = agent.snapshot();
            match self
                .orchestrator
                .diagnostician_aggregate(i, i % diagnosticians, &snapshot)
                .await
            {
                Ok(report) => {
                    info!(
                        "{} checked in with diagnostician {} ({} records bundled)",
                        agent.participant.id(),
                        i % diagnosticians,
                        report.bundled
                    );
                    agent.pending.clear();
                    agent.checked_in = true;
                    agent.target = None;
                    self.stats.check_ins += 1;
                    self.stats.bundle_rejections += report.rejected as u64;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Check-in of {} failed: {}", agent.participant.id(), e);
                    self.stats.failed_check_ins += 1;
                }
            }
        }
        Ok(())
    }

    async fn run_solver(&mut self) -> Result<(), TraceError> {
        self.stats.solver_runs += 1;
        match self.solver.run().await {
            Ok(report) => {
                if report.published.is_some() {
                    self.stats.notifications_published += 1;
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Solver pass failed: {}", e);
                self.stats.failed_solver_runs += 1;
                Ok(())
            }
        }
    }

    /// Every agent scans the notification log concurrently.
    async fn scan_notifications(&mut self, now: Duration) {
        let mut scans = JoinSet::new();
        for i in 0..self.agents.len() {
            let orchestrator = self.orchestrator.clone();
            scans.spawn(async move { (i, orchestrator.notification_scan(i).await) });
        }

        let mut results: Vec<(usize, NotificationScan)> = Vec::with_capacity(self.agents.len());
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok((i, Ok(scan))) => results.push((i, scan)),
                Ok((i, Err(e))) => {
                    warn!("Notification scan of agent {} failed: {}", i, e);
                    self.stats.failed_scans += 1;
                }
                Err(e) => {
                    warn!("Notification scan task failed: {}", e);
                    self.stats.failed_scans += 1;
                }
            }
        }

        // Completion order is not deterministic; apply in agent order
        results.sort_by_key(|(i, _)| *i);
        for (i, scan) in results {
            self.stats.scans_verified += scan.verified as u64;
            self.stats.scans_rejected += scan.rejected as u64;
            self.stats.scans_undecodable += scan.undecodable as u64;

            let agent = &mut self.agents[i];
            if agent.participant.notify(&scan.possible, now).is_some() {
                info!("{} notified of a possible infection", agent.participant.id());
                agent.target = None;
                self.stats.notified += 1;
            }
        }
    }

    /// Protocol invariants that must hold at any point of a run.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for agent in &self.agents {
            let p = &agent.participant;
            let medical = p.medical();

            if p.is_quarantined() && !self.solver.signed().contains(p.id()) {
                violations.push(format!("{} is {} without a verified notification", p.id(), p.state().name()));
            }
            if medical.infection_date.is_some() && p.state() == ParticipantState::Normal {
                violations.push(format!("{} recovered from infection", p.id()));
            }
            if medical.quarantined_date.is_some() && medical.notification_date.is_none() {
                violations.push(format!("{} quarantined before notification", p.id()));
            }
        }
        violations
    }

    fn centre_bounds(&self) -> (f64, f64, f64, f64) {
        let low = (self.config.world_size - self.config.centre_size) / 2.0;
        let high = low + self.config.centre_size;
        (low, low, high, high)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<SimContext>> {
        &self.orchestrator
    }

    pub fn ledger(&self) -> &SimLedger {
        &self.ledger
    }

    pub fn solver(&self) -> &ProximitySolver {
        &self.solver
    }

    pub fn agents(&self) -> &[SimAgent] {
        &self.agents
    }

    pub fn stats(&self) -> &WorldStats {
        &self.stats
    }

    /// Number of agents currently in the given state.
    pub fn count(&self, state: ParticipantState) -> usize {
        self.agents.iter().filter(|a| a.participant.state() == state).count()
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

fn in_bounds((x0, y0, x1, y1): (f64, f64, f64, f64), x: f64, y: f64) -> bool {
    x >= x0 && x <= x1 && y >= y0 && y <= y1
}

fn random_point<R: Rng>(rng: &mut R, (x0, y0, x1, y1): (f64, f64, f64, f64)) -> (f64, f64) {
    (rng.gen_range(x0..=x1), rng.gen_range(y0..=y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(seed: u64) -> SimConfig {
        SimConfig {
            seed,
            num_agents: 8,
            num_diagnosticians: 1,
            max_duration_secs: 120.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sim_world_creation() {
        let world = SimWorld::new(small(42)).unwrap();
        assert_eq!(world.agents().len(), 8);
        assert_eq!(world.count(ParticipantState::Infected), 2);
        assert_eq!(world.orchestrator().registry().diagnostician_count(), 1);
        assert_eq!(
            world.orchestrator().config().trusted_notifiers,
            vec![world.solver().public_key()]
        );
    }

    #[tokio::test]
    async fn test_sim_world_tick() {
        let mut world = SimWorld::new(small(42)).unwrap();
        assert_eq!(world.tick_count(), 0);

        world.tick().await.unwrap();

        assert_eq!(world.tick_count(), 1);
        assert!((world.time() - 1.0).abs() < 1e-9);
        // First tick: every agent publishes its first sample
        assert_eq!(world.stats().writes, 8);
    }

    #[tokio::test]
    async fn test_writes_respect_throttle() {
        let mut world = SimWorld::new(small(7)).unwrap();
        for _ in 0..25 {
            world.tick().await.unwrap();
        }
        // t=1, 11, 21 for each agent (unless checked in)
        assert!(world.stats().writes <= 8 * 3);
        assert!(world.stats().writes >= 8);
    }

    #[tokio::test]
    async fn test_symptomatic_agent_checks_in() {
        let config = SimConfig {
            num_agents: 3,
            num_diagnosticians: 1,
            initial_infected: 1,
            infection_probability: 0.0,
            symptom_delay_ms: 0,
            velocity: 1_000.0,
            ..small(3)
        };
        let mut world = SimWorld::new(config).unwrap();
        for _ in 0..3 {
            world.tick().await.unwrap();
        }
        assert_eq!(world.stats().check_ins, 1);
        assert!(world.agents()[0].checked_in);
    }

    #[tokio::test]
    async fn test_same_seed_same_run() {
        let mut a = SimWorld::new(small(11)).unwrap();
        let mut b = SimWorld::new(small(11)).unwrap();
        a.run().await.unwrap();
        b.run().await.unwrap();

        assert_eq!(a.stats(), b.stats());
        let pos = |w: &SimWorld| w.agents().iter().map(|x| (x.x, x.y)).collect::<Vec<_>>();
        assert_eq!(pos(&a), pos(&b));
    }

    #[tokio::test]
    async fn test_run_keeps_invariants() {
        let mut world = SimWorld::new(small(5)).unwrap();
        world.run().await.unwrap();
        assert!(world.invariant_violations().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(SimConfig::default().validate().is_ok());
        assert!(SimConfig { num_agents: 0, ..Default::default() }.validate().is_err());
        assert!(SimConfig { initial_infected: 99, num_agents: 3, ..Default::default() }.validate().is_err());
        assert!(SimConfig { infection_probability: 1.5, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_agent_step_reaches_target() {
        let mut agent = SimAgent {
            participant: Participant::new("agent-0", 0, Duration::from_secs(10)),
            x: 0.0,
            y: 0.0,
            target: Some((3.0, 4.0)),
            pending: Vec::new(),
            checked_in: false,
        };
        agent.step(2.0);
        assert!((agent.x - 1.2).abs() < 1e-9 && (agent.y - 1.6).abs() < 1e-9);
        agent.step(10.0);
        assert_eq!((agent.x, agent.y), (3.0, 4.0));
        assert!(agent.target.is_none());
    }
}
