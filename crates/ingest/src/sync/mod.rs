//! Sync job orchestration
//!
//! [`SyncService`] admits jobs and puts them on a [`JobQueue`]; queue workers
//! hand each job to exactly one [`Orchestrator::run`].

mod orchestrator;
mod queue;
mod service;
mod sink;

pub use orchestrator::{Orchestrator, SyncOutcome};
pub use queue::{JobQueue, SyncTask};
pub use service::{Submission, SyncService};
pub use sink::{DiscardSink, MessageSink};
