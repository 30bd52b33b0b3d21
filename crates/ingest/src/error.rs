//! Error types shared across the ingestion pipeline

use crate::gmail::TransportError;
use crate::models::{AccountId, JobId, JobStatus};

/// Failure raised by a fetch client after its retry policy has been applied
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The last transient transport failure, re-raised once attempts ran out
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Every attempt returned a retryable status
    #[error("Retries exhausted after {attempts} attempts (last status {last_status})")]
    RetriesExhausted { attempts: u32, last_status: u16 },

    /// A status that is never retried (e.g. 400, 401, 404)
    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Fetch client is closed")]
    Closed,

    #[error("Request gate closed")]
    LimiterClosed,
}

impl FetchError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::RetriesExhausted { last_status, .. } => Some(*last_status),
            _ => None,
        }
    }
}

/// Errors surfaced by the orchestrator, the registries and the submission path
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Email account {0} not found")]
    AccountNotFound(AccountId),

    #[error("No authentication data found for email account {0}")]
    CredentialMissing(AccountId),

    #[error("Access token missing for email account {0}")]
    AccessTokenMissing(AccountId),

    #[error("Refresh token not available for email account {0}. Please re-authenticate.")]
    RefreshTokenMissing(AccountId),

    #[error("Refresh token has expired for email account {0}. Please re-authenticate.")]
    RefreshTokenExpired(AccountId),

    #[error("Provider user identifier missing for email account {0}")]
    UserIdentifierMissing(AccountId),

    #[error("Unsupported email provider for {capability}: {provider}")]
    UnsupportedProvider {
        provider: String,
        capability: &'static str,
    },

    #[error("Sync job {0} not found")]
    JobNotFound(JobId),

    #[error("Sync job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Sync job {job_id} progress cannot go from {current} back to {requested}")]
    ProgressRegression {
        job_id: JobId,
        current: u64,
        requested: u64,
    },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for IngestError {
    /// Domain errors raised inside a store come back out as themselves
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<IngestError>() {
            Ok(inner) => inner,
            Err(err) => IngestError::Store(err),
        }
    }
}

impl IngestError {
    /// Configuration problems detected before any network access
    pub fn is_configuration(&self) -> bool {
        matches!(self, IngestError::UnsupportedProvider { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_keeps_domain_error() {
        let job_id = JobId::generate();
        let err = IngestError::from(anyhow::Error::from(IngestError::JobNotFound(job_id)));
        assert!(matches!(err, IngestError::JobNotFound(id) if id == job_id));

        let err = IngestError::from(anyhow::Error::from(IngestError::UnsupportedProvider {
            provider: "yahoo".to_string(),
            capability: "provider tag",
        }));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_other_store_errors_stay_wrapped() {
        let err = IngestError::from(anyhow::anyhow!("disk I/O error"));
        assert!(matches!(err, IngestError::Store(_)));
        assert_eq!(err.to_string(), "disk I/O error");
    }
}
