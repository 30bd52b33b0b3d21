//! Google OAuth2 access token refresh
//!
//! The sync path never calls into this module. It backs the explicit
//! `refresh` capability: given a stored credential with a live refresh token,
//! mint a new access token and write the updated credential back.
//! Uses synchronous HTTP (ureq) on a blocking thread.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::Deserialize;

use crate::config::OAuthClientConfig;
use crate::models::Credential;
use crate::storage::CredentialStore;

/// Token response from Google
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: Option<i64>,
    /// Refresh token lifetime in seconds, reported for time-limited grants
    pub refresh_token_expires_in: Option<i64>,
}

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Refresher posting `grant_type=refresh_token` to Google's token endpoint
pub struct GoogleTokenRefresher {
    client: OAuthClientConfig,
    agent: ureq::Agent,
}

impl GoogleTokenRefresher {
    pub fn new(client: OAuthClientConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(30)))
            .http_status_as_error(false)
            .build()
            .into();
        Self { client, agent }
    }

    fn post(agent: &ureq::Agent, client: &OAuthClientConfig, refresh_token: &str) -> Result<TokenResponse> {
        let mut response = agent
            .post(&client.token_url)
            .send_form([
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            bail!("Token endpoint returned HTTP {}: {}", status, body);
        }

        response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")
    }
}

#[async_trait]
impl TokenRefresher for GoogleTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let agent = self.agent.clone();
        let client = self.client.clone();
        let refresh_token = refresh_token.to_string();
        tokio::task::spawn_blocking(move || Self::post(&agent, &client, &refresh_token))
            .await
            .context("Token refresh worker failed")?
    }
}

/// Fold a token response into a credential.
///
/// The refresh token is preserved when Google does not return a new one.
pub fn apply_token_response(mut credential: Credential, token: TokenResponse, now: DateTime<Utc>) -> Credential {
    credential.access_token = Some(token.access_token);
    credential.expires_at = token.expires_in.map(|secs| now + Duration::seconds(secs));

    if let Some(refresh_token) = token.refresh_token {
        credential.refresh_token = Some(refresh_token);
        if let Some(secs) = token.refresh_token_expires_in {
            credential.refresh_token_expires_at = Some(now + Duration::seconds(secs));
        }
    }

    credential.updated_at = now;
    credential
}

/// Refresh the credential owned by a provider user and persist the result
pub async fn refresh_credential(
    store: &dyn CredentialStore,
    refresher: &dyn TokenRefresher,
    provider_user_id: &str,
) -> Result<Credential> {
    let credential = store
        .find_by_provider_user_id(provider_user_id)?
        .with_context(|| format!("No credential for provider user {}", provider_user_id))?;

    let now = Utc::now();
    credential.ensure_refreshable(now)?;
    let refresh_token = credential.refresh_token.clone().unwrap_or_default();

    let token = refresher.refresh(&refresh_token).await?;
    let updated = apply_token_response(credential, token, now);
    store.save_credential(updated.clone())?;

    info!("Refreshed access token for account {}", updated.account_id);
    Ok(updated)
}
