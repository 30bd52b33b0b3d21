//! Gmail implementations of the provider strategies

use async_trait::async_trait;
use std::sync::Arc;

use super::client::GmailClient;
use super::transport::{HttpTransport, UreqTransport};
use crate::config::FetchSettings;
use crate::error::FetchError;
use crate::models::{AccountId, Credential, MessageFormat, MessageId, MessageRecord, ProviderKind};
use crate::provider::{CredentialSource, ListQuery, MailProvider, MessagePages, ProviderAuth};
use crate::storage::CredentialStore;

/// Gmail message listing and retrieval over [`GmailClient`]
pub struct GmailProvider {
    client: GmailClient,
}

impl GmailProvider {
    pub fn new(settings: &FetchSettings) -> Self {
        let transport = Arc::new(UreqTransport::new(settings.timeout()));
        Self::with_transport(settings, transport)
    }

    pub fn with_transport(settings: &FetchSettings, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            client: GmailClient::new(settings, transport),
        }
    }

    pub fn client(&self) -> &GmailClient {
        &self.client
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn list_messages<'a>(&'a self, auth: &'a ProviderAuth, query: &'a ListQuery) -> MessagePages<'a> {
        self.client
            .list_messages(&auth.user_identifier, &auth.access_token, query)
    }

    async fn fetch_messages_by_ids(
        &self,
        ids: &[MessageId],
        auth: &ProviderAuth,
        format: MessageFormat,
    ) -> Result<Vec<MessageRecord>, FetchError> {
        self.client
            .fetch_messages_by_ids(ids, &auth.user_identifier, &auth.access_token, format)
            .await
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.client.close()
    }
}

/// Gmail credentials from the credential store.
///
/// The user identifier is the Google user id recorded at authorization.
pub struct GmailCredentialSource {
    store: Arc<dyn CredentialStore>,
}

impl GmailCredentialSource {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }
}

impl CredentialSource for GmailCredentialSource {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    fn load_auth_data(&self, account_id: &AccountId) -> anyhow::Result<Option<Credential>> {
        self.store.load_credential(account_id)
    }

    fn get_user_identifier(&self, credential: &Credential) -> Option<String> {
        credential
            .provider_user_id
            .as_ref()
            .filter(|id| !id.is_empty())
            .cloned()
    }
}
