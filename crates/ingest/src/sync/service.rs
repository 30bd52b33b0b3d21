//! Submission and polling of mailbox syncs

use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;

use super::queue::{JobQueue, SyncTask};
use crate::error::IngestError;
use crate::models::{AccountId, JobId, JobKey, JobProgress, MailAccount, SyncJob};
use crate::storage::{AccountStore, CredentialStore, JobStore};

/// Result of a submission
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job: SyncJob,
    /// Whether this submission created the job. Only then was it queued.
    pub created: bool,
}

pub struct SyncService {
    jobs: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStore>,
    credentials: Arc<dyn CredentialStore>,
    queue: Arc<JobQueue>,
}

impl SyncService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStore>,
        credentials: Arc<dyn CredentialStore>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            jobs,
            accounts,
            credentials,
            queue,
        }
    }

    /// Check that an account may be submitted.
    ///
    /// The refresh token must be present and unexpired; a missing access
    /// token alone is accepted.
    pub fn check_credentials(&self, account_id: &AccountId) -> Result<MailAccount, IngestError> {
        let account = self
            .accounts
            .get_account(account_id)?
            .ok_or_else(|| IngestError::AccountNotFound(account_id.clone()))?;
        let credential = self
            .credentials
            .load_credential(account_id)?
            .ok_or_else(|| IngestError::CredentialMissing(account_id.clone()))?;
        credential.ensure_refreshable(Utc::now())?;
        Ok(account)
    }

    /// Validate, pass the admission gate and queue the job if this call
    /// created it
    pub fn submit(
        &self,
        account_id: &AccountId,
        idempotency_key: Option<&str>,
    ) -> Result<Submission, IngestError> {
        self.check_credentials(account_id)?;

        let key = JobKey::mailbox_sync(account_id.as_str());
        let (job, created) = self.jobs.get_or_create_active_job(&key)?;
        if !created {
            info!(
                "Sync already {} for account {} (job {})",
                job.status, account_id, job.id
            );
            return Ok(Submission { job, created });
        }

        let task = SyncTask {
            job_id: job.id,
            account_id: account_id.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        };
        if let Err(e) = self.queue.enqueue(task) {
            warn!("Could not queue sync job {}: {}", job.id, e);
            self.jobs.mark_failed(&job.id, &e.to_string())?;
            return Err(e);
        }

        info!("Queued sync job {} for account {}", job.id, account_id);
        Ok(Submission { job, created })
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobProgress, IngestError> {
        self.jobs
            .get_job(job_id)?
            .map(|job| job.progress())
            .ok_or(IngestError::JobNotFound(*job_id))
    }

    /// Fail an active job that no worker is going to finish, such as one left
    /// running by a process that exited. The account can be submitted again
    /// afterwards.
    pub fn abandon_job(&self, job_id: &JobId, reason: &str) -> Result<JobProgress, IngestError> {
        let job = self.jobs.mark_failed(job_id, reason)?;
        warn!("Abandoned sync job {} for {}: {}", job.id, job.resource_id, reason);
        Ok(job.progress())
    }

    pub fn has_active_sync(&self, account_id: &AccountId) -> Result<bool, IngestError> {
        let key = JobKey::mailbox_sync(account_id.as_str());
        Ok(self.jobs.find_active_job(&key)?.is_some())
    }
}
