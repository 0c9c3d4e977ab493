//! appcop - an application cop for Marathon-style orchestrators
//!
//! appcop subscribes to the orchestrator's event stream, keeps a rolling
//! misbehavior score per application, scales repeat offenders down one
//! instance at a time, and garbage collects applications that have been
//! suspended for too long along with the empty groups they leave behind.

pub mod config;
pub mod error;
pub mod events;
pub mod gc;
pub mod metrics;
pub mod orchestrator;
pub mod score;
pub mod service;
pub mod sse;
pub mod worker;

// Re-export main types
pub use config::Config;
pub use error::{AppcopError, Result};
pub use events::Event;
pub use metrics::Metrics;
pub use orchestrator::{App, AppId, Group, GroupId, HttpOrchestrator, Orchestrator, Task, TaskId};
pub use score::{ScoreUpdate, Scorer};

/// appcop version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default address for the health endpoint
    pub const LISTEN: &str = "0.0.0.0:4444";

    /// Default size of the bounded event queue
    pub const QUEUE_SIZE: usize = 1000;

    /// Default number of event workers
    pub const WORKERS_COUNT: usize = 10;

    /// Default score at which an application is scaled down
    pub const SCALE_DOWN_SCORE: i64 = 200;

    /// Seconds between leader polls during startup
    pub const LEADER_POLL_SECS: u64 = 5;

    /// Orchestrator request timeout in seconds
    pub const ORCHESTRATOR_TIMEOUT_SECS: u64 = 30;
}
