//! Sync job record and its state machine
//!
//! `queued -> running -> {succeeded, failed}`. A queued job may also fail
//! directly (when the run cannot even start). Terminal jobs are never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::IngestError;

/// Unique identifier of a sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Queued or running
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => anyhow::bail!("Unknown job status: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    EmailAccount,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::EmailAccount => "email_account",
        }
    }
}

impl FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email_account" => Ok(ResourceType::EmailAccount),
            other => anyhow::bail!("Unknown resource type: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    MailboxSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::MailboxSync => "mailbox_sync",
        }
    }
}

impl FromStr for JobType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mailbox_sync" => Ok(JobType::MailboxSync),
            other => anyhow::bail!("Unknown job type: {}", other),
        }
    }
}

/// The tuple the admission gate keeps unique among active jobs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub job_type: JobType,
}

impl JobKey {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            job_type,
        }
    }

    /// Key for a mailbox sync of the given account
    pub fn mailbox_sync(account_id: impl Into<String>) -> Self {
        Self::new(ResourceType::EmailAccount, account_id, JobType::MailboxSync)
    }
}

/// Persisted unit-of-work record for one ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_current: u64,
    pub progress_total: Option<u64>,
    pub error_message: Option<String>,
    /// Caller-supplied key recorded when the run starts
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncJob {
    /// Create a new queued job for the key
    pub fn queued(key: &JobKey) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            resource_type: key.resource_type,
            resource_id: key.resource_id.clone(),
            job_type: key.job_type,
            status: JobStatus::Queued,
            progress_current: 0,
            progress_total: None,
            error_message: None,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.resource_type, self.resource_id.clone(), self.job_type)
    }

    fn invalid(&self, to: JobStatus) -> IngestError {
        IngestError::InvalidTransition {
            job_id: self.id,
            from: self.status,
            to,
        }
    }

    /// queued -> running
    pub fn start(&mut self, idempotency_key: Option<&str>) -> Result<(), IngestError> {
        if self.status != JobStatus::Queued {
            return Err(self.invalid(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.idempotency_key = idempotency_key.map(str::to_string);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record progress on a running job. `current` never decreases.
    pub fn record_progress(&mut self, current: u64, total: Option<u64>) -> Result<(), IngestError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Running));
        }
        if current < self.progress_current {
            return Err(IngestError::ProgressRegression {
                job_id: self.id,
                current: self.progress_current,
                requested: current,
            });
        }
        self.progress_current = current;
        if total.is_some() {
            self.progress_total = total;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// running -> succeeded
    pub fn succeed(&mut self) -> Result<(), IngestError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Succeeded));
        }
        let now = Utc::now();
        self.status = JobStatus::Succeeded;
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// queued | running -> failed
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), IngestError> {
        if self.status.is_terminal() {
            return Err(self.invalid(JobStatus::Failed));
        }
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Polling view of this job
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            status: self.status,
            progress_current: self.progress_current,
            progress_total: self.progress_total,
            error_message: self.error_message.clone(),
        }
    }
}

/// What a poller sees for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub progress_current: u64,
    pub progress_total: Option<u64>,
    pub error_message: Option<String>,
}
