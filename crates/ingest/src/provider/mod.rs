//! Provider-agnostic strategy traits
//!
//! Message fetching and credential access vary independently between
//! providers, so each gets its own trait and its own registry. The
//! orchestrator only ever sees these traits.

mod registry;

pub use registry::{CredentialFactory, CredentialRegistry, ProviderFactory, ProviderRegistry};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

use crate::error::FetchError;
use crate::models::{AccountId, Credential, MessageFormat, MessageId, MessagePage, MessageRecord, ProviderKind};

/// Lazy, finite sequence of listing pages
pub type MessagePages<'a> = BoxStream<'a, Result<MessagePage, FetchError>>;

/// Parameters of a message listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page_size: u32,
    pub include_spam_trash: bool,
    /// Only list messages carrying all of these labels
    pub label_ids: Vec<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page_size: 500,
            include_spam_trash: false,
            label_ids: Vec::new(),
        }
    }
}

/// What a provider needs to authenticate requests for one account
#[derive(Clone)]
pub struct ProviderAuth {
    pub user_identifier: String,
    pub access_token: String,
}

impl ProviderAuth {
    pub fn new(user_identifier: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_identifier: user_identifier.into(),
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderAuth")
            .field("user_identifier", &self.user_identifier)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Message listing and retrieval for one provider.
///
/// An instance owns network resources; [`MailProvider::close`] must be
/// called exactly once when the instance is done.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Page through message ids matching the query
    fn list_messages<'a>(&'a self, auth: &'a ProviderAuth, query: &'a ListQuery) -> MessagePages<'a>;

    /// Fetch records for `ids`, in the same order as `ids`
    async fn fetch_messages_by_ids(
        &self,
        ids: &[MessageId],
        auth: &ProviderAuth,
        format: MessageFormat,
    ) -> Result<Vec<MessageRecord>, FetchError>;

    async fn close(&self) -> Result<(), FetchError>;
}

/// Credential lookup for one provider
pub trait CredentialSource: Send + Sync {
    fn provider(&self) -> ProviderKind;

    fn load_auth_data(&self, account_id: &AccountId) -> anyhow::Result<Option<Credential>>;

    /// Provider-side user identifier used in API paths
    fn get_user_identifier(&self, credential: &Credential) -> Option<String>;
}
