//! The call orchestrator and janitor: the core of the intercom control
//! plane. Everything here is driven by engine events and HTTP-triggered
//! client actions, and holds no per-call state beyond what is written to
//! the KV store and the realtime store.

mod core;
mod error;
mod ids;
mod janitor;
mod settings;

pub use core::Orchestrator;
pub use error::OrchestratorError;
pub use janitor::{spawn as spawn_janitor, pending_originate_retry, stale_endpoint_sweep, JanitorHandles};
pub use settings::OrchestratorSettings;
