//! LedgerTrace Deterministic Simulation Harness
//!
//! This crate provides a controlled world where the whole contact-tracing
//! protocol runs reproducibly from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only on ticks and retry backoff
//! - **Ledger**: In-memory ledger with seeded publish/fetch/ack faults
//! - **Randomness**: Identities, movement and faults derived from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────┐  ┌──────────┐        ┌──────────────────┐     │
//! │  │ Agent #0 │  │ Agent #1 │  ...   │ ProximitySolver  │     │
//! │  └────┬─────┘  └────┬─────┘        └────────▲─────────┘     │
//! │       │             │                       │               │
//! │  ┌────▼─────────────▼───────────────────────┴─────────┐     │
//! │  │  Orchestrator (channels, checksums, escalation)    │     │
//! │  └────────────────────────┬───────────────────────────┘     │
//! │                           │                                 │
//! │  ┌────────────────────────▼───────────────────────────┐     │
//! │  │  SimLedger (fault injection) + SimLedgerController │     │
//! │  └────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ledgertrace_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 30).with_duration(600.0);
//! let result = runner.run(ScenarioId::Outbreak).await;
//! ```

mod context;
mod error;
mod ledger;
mod runner;
mod solver;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use ledger::{LedgerStats, SimLedger, SimLedgerController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use solver::{AgentDirectory, ProximitySolver, SolverReport};
pub use world::{SimAgent, SimConfig, SimWorld, WorldStats};
