//! aether-manager: shard manager worker.
//!
//! A manager owns a fixed subset of shards within one cluster. It listens to
//! the supervisor over a framed control channel and, on `RESTART_CLIENT`,
//! either terminates (so the process manager respawns it with a new layout) or
//! reconciles in place and re-announces everything it owns.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod dispatch;
mod logging;
pub mod manager;
pub mod rebroadcast;
pub mod reconcile;
pub mod resources;
pub mod state;
pub mod stats;
mod version;

pub use bridge::protocol::{Envelope, EventType, RestartDirective};
pub use channel::{ControlChannel, PendingReplies};
pub use config::{ConfigError, ManagerConfig};
pub use dispatch::{DispatchTable, Dispatched, EventHandler, HandlerError};
pub use logging::init_tracing;
pub use manager::{Shutdown, run_manager, run_manager_with};
pub use rebroadcast::{ReadyInfo, Rebroadcaster};
pub use reconcile::{Decision, Outcome, RestartHandler, decide};
pub use resources::{OwnershipHandler, ResourceRegistry, ResourceSource};
pub use state::{KillReason, WorkerIdentity, WorkerState};
pub use stats::EventStats;
pub use version::{BuildInfo, MANAGER_VERSION};
