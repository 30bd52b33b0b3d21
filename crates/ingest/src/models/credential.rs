//! Stored OAuth credential for one provider connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::AccountId;
use crate::error::IngestError;

/// Access/refresh token pair and expiry metadata for an account.
///
/// Read-only from the sync path's point of view. Only the refresh capability
/// writes new values.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub account_id: AccountId,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// When the access token expires
    pub expires_at: Option<DateTime<Utc>>,
    /// When the refresh token expires; past this point the account needs
    /// re-authentication
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    /// Provider-specific user identifier (Google user id for Gmail)
    pub provider_user_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            refresh_token_expires_at: None,
            provider_user_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        self.access_token = Some(token.into());
        self.expires_at = expires_at;
        self
    }

    pub fn with_refresh_token(
        mut self,
        token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.refresh_token = Some(token.into());
        self.refresh_token_expires_at = expires_at;
        self
    }

    pub fn with_provider_user_id(mut self, id: impl Into<String>) -> Self {
        self.provider_user_id = Some(id.into());
        self
    }

    /// Whether the refresh token's expiry lies in the past
    pub fn is_refresh_expired(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token_expires_at.is_some_and(|at| at < now)
    }

    /// Whether the access token's recorded expiry lies in the past
    pub fn is_access_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Check that the account can be submitted for sync.
    ///
    /// A missing access token is accepted here: the refresh token can still
    /// mint one.
    pub fn ensure_refreshable(&self, now: DateTime<Utc>) -> Result<(), IngestError> {
        if self.refresh_token.is_none() {
            return Err(IngestError::RefreshTokenMissing(self.account_id.clone()));
        }
        if self.is_refresh_expired(now) {
            return Err(IngestError::RefreshTokenExpired(self.account_id.clone()));
        }
        Ok(())
    }

    /// Check that a sync run can start with this credential, returning the
    /// access token to use
    pub fn ensure_syncable(&self, now: DateTime<Utc>) -> Result<&str, IngestError> {
        if self.is_refresh_expired(now) {
            return Err(IngestError::RefreshTokenExpired(self.account_id.clone()));
        }
        self.access_token
            .as_deref()
            .ok_or_else(|| IngestError::AccessTokenMissing(self.account_id.clone()))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("refresh_token_expires_at", &self.refresh_token_expires_at)
            .field("provider_user_id", &self.provider_user_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential() -> Credential {
        Credential::new(AccountId::new("acct-1"))
    }

    #[test]
    fn test_refresh_expiry() {
        let now = Utc::now();
        let expired = credential().with_refresh_token("r", Some(now - Duration::hours(1)));
        assert!(expired.is_refresh_expired(now));

        let valid = credential().with_refresh_token("r", Some(now + Duration::days(1)));
        assert!(!valid.is_refresh_expired(now));

        let no_expiry = credential().with_refresh_token("r", None);
        assert!(!no_expiry.is_refresh_expired(now));
    }

    #[test]
    fn test_ensure_refreshable_accepts_missing_access_token() {
        let now = Utc::now();
        let cred = credential().with_refresh_token("r", Some(now + Duration::days(1)));
        assert!(cred.ensure_refreshable(now).is_ok());
    }

    #[test]
    fn test_ensure_refreshable_rejects() {
        let now = Utc::now();
        assert!(matches!(
            credential().ensure_refreshable(now),
            Err(IngestError::RefreshTokenMissing(_))
        ));

        let expired = credential().with_refresh_token("r", Some(now - Duration::seconds(1)));
        assert!(matches!(
            expired.ensure_refreshable(now),
            Err(IngestError::RefreshTokenExpired(_))
        ));
    }

    #[test]
    fn test_ensure_syncable() {
        let now = Utc::now();
        let cred = credential().with_access_token("a", None);
        assert_eq!(cred.ensure_syncable(now).unwrap(), "a");

        assert!(matches!(
            credential().ensure_syncable(now),
            Err(IngestError::AccessTokenMissing(_))
        ));

        // Refresh expiry wins even when an access token is present
        let expired = credential()
            .with_access_token("a", None)
            .with_refresh_token("r", Some(now - Duration::minutes(5)));
        assert!(matches!(
            expired.ensure_syncable(now),
            Err(IngestError::RefreshTokenExpired(_))
        ));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let cred = credential()
            .with_access_token("secret-access", None)
            .with_refresh_token("secret-refresh", None);
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("<redacted>"));
    }
}
