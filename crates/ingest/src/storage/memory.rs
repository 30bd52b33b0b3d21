//! In-memory storage implementation
//!
//! Used by tests and by embedders that keep job state in-process.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use super::{AccountStore, CredentialStore, JobStore};
use crate::error::IngestError;
use crate::models::{AccountId, Credential, JobId, JobKey, MailAccount, SyncJob};

/// In-memory implementation of all three stores
///
/// Uses HashMaps protected by RwLocks for thread-safe access.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, SyncJob>>,
    accounts: RwLock<HashMap<AccountId, MailAccount>>,
    credentials: RwLock<HashMap<AccountId, Credential>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A writer that panicked mid-update never leaves a half-applied job:
    // transitions are computed on a clone and swapped in whole.
    fn jobs_mut(&self) -> RwLockWriteGuard<'_, HashMap<JobId, SyncJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition<F>(&self, id: &JobId, apply: F) -> Result<SyncJob>
    where
        F: FnOnce(&mut SyncJob) -> Result<(), IngestError>,
    {
        let mut jobs = self.jobs_mut();
        let current = jobs.get(id).ok_or(IngestError::JobNotFound(*id))?;
        let mut next = current.clone();
        apply(&mut next)?;
        jobs.insert(*id, next.clone());
        Ok(next)
    }

    /// All jobs for a key, any status, oldest first
    pub fn jobs_for(&self, key: &JobKey) -> Vec<SyncJob> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<SyncJob> = jobs.values().filter(|j| &j.key() == key).cloned().collect();
        matching.sort_by_key(|j| j.created_at);
        matching
    }
}

impl JobStore for InMemoryStore {
    fn get_or_create_active_job(&self, key: &JobKey) -> Result<(SyncJob, bool)> {
        // Check and insert under the same write lock
        let mut jobs = self.jobs_mut();
        if let Some(existing) = jobs
            .values()
            .find(|j| j.status.is_active() && &j.key() == key)
        {
            return Ok((existing.clone(), false));
        }

        let job = SyncJob::queued(key);
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    fn find_active_job(&self, key: &JobKey) -> Result<Option<SyncJob>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs
            .values()
            .find(|j| j.status.is_active() && &j.key() == key)
            .cloned())
    }

    fn get_job(&self, id: &JobId) -> Result<Option<SyncJob>> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(id).cloned())
    }

    fn mark_running(&self, id: &JobId, idempotency_key: Option<&str>) -> Result<SyncJob> {
        self.transition(id, |job| job.start(idempotency_key))
    }

    fn update_progress(&self, id: &JobId, current: u64, total: Option<u64>) -> Result<()> {
        self.transition(id, |job| job.record_progress(current, total))?;
        Ok(())
    }

    fn mark_succeeded(&self, id: &JobId) -> Result<SyncJob> {
        self.transition(id, |job| job.succeed())
    }

    fn mark_failed(&self, id: &JobId, message: &str) -> Result<SyncJob> {
        self.transition(id, |job| job.fail(message))
    }
}

impl AccountStore for InMemoryStore {
    fn get_account(&self, id: &AccountId) -> Result<Option<MailAccount>> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        Ok(accounts.get(id).cloned())
    }

    fn upsert_account(&self, account: MailAccount) -> Result<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        accounts.insert(account.id.clone(), account);
        Ok(())
    }
}

impl CredentialStore for InMemoryStore {
    fn load_credential(&self, account_id: &AccountId) -> Result<Option<Credential>> {
        let credentials = self.credentials.read().unwrap_or_else(PoisonError::into_inner);
        Ok(credentials.get(account_id).cloned())
    }

    fn find_by_provider_user_id(&self, provider_user_id: &str) -> Result<Option<Credential>> {
        let credentials = self.credentials.read().unwrap_or_else(PoisonError::into_inner);
        Ok(credentials
            .values()
            .find(|c| c.provider_user_id.as_deref() == Some(provider_user_id))
            .cloned())
    }

    fn save_credential(&self, credential: Credential) -> Result<()> {
        let mut credentials = self.credentials.write().unwrap_or_else(PoisonError::into_inner);
        credentials.insert(credential.account_id.clone(), credential);
        Ok(())
    }
}
