//! Storage traits and implementations
//!
//! Jobs, accounts and credentials sit behind traits so the orchestrator can
//! run against the SQLite store in production and the in-memory store in
//! tests.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AccountStore, CredentialStore, JobStore};
