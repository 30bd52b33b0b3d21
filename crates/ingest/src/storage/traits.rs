//! Storage trait definitions

use anyhow::Result;

use crate::models::{AccountId, Credential, JobId, JobKey, MailAccount, SyncJob};

/// Persistence of sync jobs.
///
/// Every mutating method is a self-contained unit: it loads the job, applies
/// the state-machine transition and writes it back under one lock or
/// transaction. Nothing is carried between calls, so a call made after a
/// failure never inherits a broken context.
pub trait JobStore: Send + Sync {
    /// Admission gate: return the active (queued or running) job for the key,
    /// or atomically create a queued one.
    ///
    /// The boolean is `true` only for the caller that created the job; only
    /// that caller may start an orchestration for it.
    fn get_or_create_active_job(&self, key: &JobKey) -> Result<(SyncJob, bool)>;

    /// Find the active job for the key, if any
    fn find_active_job(&self, key: &JobKey) -> Result<Option<SyncJob>>;

    /// Get a job by ID
    fn get_job(&self, id: &JobId) -> Result<Option<SyncJob>>;

    /// queued -> running, recording the caller's idempotency key
    fn mark_running(&self, id: &JobId, idempotency_key: Option<&str>) -> Result<SyncJob>;

    /// Persist progress on a running job
    fn update_progress(&self, id: &JobId, current: u64, total: Option<u64>) -> Result<()>;

    /// running -> succeeded
    fn mark_succeeded(&self, id: &JobId) -> Result<SyncJob>;

    /// queued | running -> failed with the error text
    fn mark_failed(&self, id: &JobId, message: &str) -> Result<SyncJob>;
}

/// Read access to mail accounts
pub trait AccountStore: Send + Sync {
    fn get_account(&self, id: &AccountId) -> Result<Option<MailAccount>>;

    /// Insert or update an account
    fn upsert_account(&self, account: MailAccount) -> Result<()>;
}

/// Credential records, one per account
pub trait CredentialStore: Send + Sync {
    fn load_credential(&self, account_id: &AccountId) -> Result<Option<Credential>>;

    fn find_by_provider_user_id(&self, provider_user_id: &str) -> Result<Option<Credential>>;

    /// Insert or replace the credential for its account
    fn save_credential(&self, credential: Credential) -> Result<()>;
}
