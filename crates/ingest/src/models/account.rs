//! Mail account model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProviderKind;

/// Identifier of a mail account (the sync job's resource id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remote mailbox connected by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: AccountId,
    /// Owning user
    pub user_id: String,
    pub email: String,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,
}

impl MailAccount {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        provider: ProviderKind,
    ) -> Self {
        Self {
            id: AccountId::new(id),
            user_id: user_id.into(),
            email: email.into(),
            provider,
            created_at: Utc::now(),
        }
    }
}
