//! LedgerTrace Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the LedgerTrace
//! protocol to run against a real ledger (tokio) or inside the deterministic
//! simulation harness.
//!
//! # Core Concept: Intercept Everything
//!
//! The protocol never touches the outside world directly:
//! - Time (`now()`, `sleep()`)
//! - Ledger I/O (`publish()`, `fetch()`)
//! - Key material (`derive_signing_key()`)
//!
//! In simulation all of these derive from a single 64-bit seed, so any
//! failing run is reproducible from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use ledgertrace_env::{LedgerProvider, TraceContext};
//!
//! async fn publish_loop<Ctx: TraceContext>(ctx: &Ctx, ledger: &dyn LedgerProvider) {
//!     loop {
//!         ledger.publish(&next_root, payload.clone()).await?;
//!         ctx.sleep(Duration::from_secs(10)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod memory;
mod provider;
mod tokio_impl;
mod types;

pub use context::TraceContext;
pub use error::EnvError;
pub use memory::InMemoryLedger;
pub use provider::LedgerProvider;
pub use tokio_impl::TokioContext;
pub use types::{Address, Confirmation};
