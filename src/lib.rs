//! A background supervisor that dispatches application-defined jobs to a bounded pool of
//! isolated worker processes.
//!
//! The supervisor detaches itself from its controlling terminal, enforces single-instance
//! semantics via a lock file, keeps a fixed-size slot table of forked workers, and drives a
//! poll/dispatch/reap loop with deterministic signal handling. Workers and the supervisor share
//! a small shared-memory region (run status, active worker count, slot occupancy, and an opaque
//! application key/value map) protected by a single named mutex.
//!
//! Embedding applications implement [`JobSource`] and hand it to [`Supervisor::run`].

pub mod app;
pub mod config;
pub mod daemonize;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod lockfile;
pub mod logging;
pub mod proctitle;
pub mod signals;
pub mod slots;
pub mod supervisor;
pub mod worker;

pub use app::JobSource;
pub use config::SupervisorConfig;
pub use error::Severity;
pub use ipc::RunStatus;
pub use slots::SlotHandle;
pub use supervisor::{ControlSurface, Supervisor};
