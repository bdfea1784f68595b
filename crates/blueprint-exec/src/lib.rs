//! # Blueprint Exec
//!
//! Execution phase of the Blueprint two-phase engine.
//!
//! This crate contains:
//! - The async executor: readiness tracking, dispatch, concurrency cap,
//!   cancellation, failure propagation
//! - Kind drivers (file, HTTP, subprocess, timer, console, compute)
//! - Combinator settlement (`gather`, `race`, `at_least`, `at_most`, `after`)
//! - The event-source loop for long-lived sockets and listeners
//!
//! Plans come from `blueprint-core`; this crate never mutates them. All
//! per-node execution state lives in a parallel table owned by the run.

pub mod config;
pub mod drivers;
pub mod events;
pub mod executor;
pub mod observer;
pub mod outcome;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ExecConfig;
    pub use crate::events::{EventRecord, EventTable, HandleId};
    pub use crate::executor::Executor;
    pub use crate::observer::{ExecEvent, ExecutionObserver};
    pub use crate::outcome::{
        ExecutionOutcome, ExecutionReport, NodeRecord, NodeState, OpError, OpErrorKind,
    };
}

// Re-export key types at crate root
pub use config::ExecConfig;
pub use events::{EventRecord, EventTable, HandleId};
pub use executor::Executor;
pub use observer::{ExecEvent, ExecutionObserver};
pub use outcome::{ExecutionOutcome, ExecutionReport, NodeState, OpError, OpErrorKind};

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;
