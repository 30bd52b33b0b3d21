//! Domain models for the ingestion pipeline

mod account;
mod credential;
mod job;
mod message;
mod provider;

pub use account::{AccountId, MailAccount};
pub use credential::Credential;
pub use job::{JobId, JobKey, JobProgress, JobStatus, JobType, ResourceType, SyncJob};
pub use message::{MessageFormat, MessageId, MessagePage, MessageRecord};
pub use provider::ProviderKind;
