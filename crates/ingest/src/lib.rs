//! Ingest crate - Asynchronous mailbox ingestion
//!
//! This crate provides the ingestion pipeline for remote mailboxes:
//! - Domain models (accounts, credentials, sync jobs, message pages)
//! - A rate-limited, retrying Gmail API client
//! - Provider and credential strategies selected through registries
//! - Job storage with an atomic admission gate (in-memory and SQLite)
//! - The sync orchestrator, submission service and worker queue
//!
//! Fetched message content is handed to a [`MessageSink`]; persisting it
//! is left to the embedding application.

pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod provider;
pub mod storage;
pub mod sync;

pub use config::{FetchSettings, IngestSettings, MailboxScope, OAuthClientConfig, SyncOptions};
pub use error::{FetchError, IngestError};
pub use gmail::{GmailClient, GmailCredentialSource, GmailProvider, GoogleTokenRefresher, refresh_credential};
pub use models::{
    AccountId, Credential, JobId, JobKey, JobProgress, JobStatus, JobType, MailAccount,
    MessageFormat, MessageId, MessagePage, MessageRecord, ProviderKind, ResourceType, SyncJob,
};
pub use provider::{CredentialRegistry, CredentialSource, ListQuery, MailProvider, ProviderAuth, ProviderRegistry};
pub use storage::{AccountStore, CredentialStore, InMemoryStore, JobStore, SqliteStore};
pub use sync::{DiscardSink, JobQueue, MessageSink, Orchestrator, Submission, SyncOutcome, SyncService, SyncTask};
