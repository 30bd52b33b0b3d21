//! Settings for the ingestion pipeline
//!
//! Loaded once at startup and handed to each component's constructor.
//! Sources, in order of priority:
//! 1. `ingest.json` in the config directory (~/.config/mail-ingest/)
//! 2. An explicit JSON file path
//! 3. Environment variables (fallback when no file is found)

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gmail::{GmailClient, RetryPolicy};
use crate::models::MessageFormat;
use crate::provider::ListQuery;

/// Settings filename in the config directory
pub const SETTINGS_FILE: &str = "ingest.json";

/// Google's OAuth2 token endpoint
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Fetch client tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    pub base_url: String,
    pub requests_per_second: usize,
    /// Maximum requests in flight per client
    pub concurrency: usize,
    /// Per-call timeout
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            base_url: GmailClient::BASE_URL.to_string(),
            requests_per_second: 50,
            concurrency: 20,
            timeout_secs: 30,
            max_attempts: 8,
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.max_attempts)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base_url: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("base_url must be http(s): {}", self.base_url);
        }
        if self.requests_per_second == 0 {
            bail!("requests_per_second must be positive");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be positive");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be positive");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be positive");
        }
        Ok(())
    }
}

/// OAuth client registration, only needed to refresh tokens
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

fn default_token_url() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

impl OAuthClientConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: default_token_url(),
        }
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .finish()
    }
}

/// A named subset of a mailbox, iterated independently during a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxScope {
    pub name: String,
    pub label_ids: Vec<String>,
}

impl MailboxScope {
    pub fn new(name: impl Into<String>, label_ids: &[&str]) -> Self {
        Self {
            name: name.into(),
            label_ids: label_ids.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn inbox() -> Self {
        Self::new("inbox", &["INBOX"])
    }

    pub fn sent() -> Self {
        Self::new("sent", &["SENT"])
    }
}

/// What a sync run lists and how it fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Scopes, processed in order
    pub scopes: Vec<MailboxScope>,
    pub page_size: u32,
    pub include_spam_trash: bool,
    pub format: MessageFormat,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            scopes: vec![MailboxScope::inbox(), MailboxScope::sent()],
            page_size: GmailClient::MAX_PAGE_SIZE,
            include_spam_trash: false,
            format: MessageFormat::Full,
        }
    }
}

impl SyncOptions {
    /// Listing parameters for one scope
    pub fn query_for(&self, scope: &MailboxScope) -> ListQuery {
        ListQuery {
            page_size: self.page_size,
            include_spam_trash: self.include_spam_trash,
            label_ids: scope.label_ids.clone(),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub database_path: PathBuf,
    /// Number of queue workers
    pub workers: usize,
    pub fetch: FetchSettings,
    pub sync: SyncOptions,
    pub oauth: Option<OAuthClientConfig>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            database_path: config::config_path("ingest.db")
                .unwrap_or_else(|| PathBuf::from("ingest.db")),
            workers: 2,
            fetch: FetchSettings::default(),
            sync: SyncOptions::default(),
            oauth: None,
        }
    }
}

impl IngestSettings {
    /// Load settings by priority, then validate
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let settings = if config::config_exists(SETTINGS_FILE) {
            config::load_json(SETTINGS_FILE)?
        } else if let Some(path) = explicit_path {
            Self::from_file(path)?
        } else {
            Self::from_env()?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse settings JSON")
    }

    /// Defaults overridden by any set environment variables
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Some(path) = config::env_parse::<PathBuf>("INGEST_DATABASE_PATH")? {
            settings.database_path = path;
        }
        if let Some(rps) = config::env_parse("INGEST_RPS")? {
            settings.fetch.requests_per_second = rps;
        }
        if let Some(concurrency) = config::env_parse("INGEST_CONCURRENCY")? {
            settings.fetch.concurrency = concurrency;
        }
        if let Some(timeout) = config::env_parse("INGEST_TIMEOUT_SECS")? {
            settings.fetch.timeout_secs = timeout;
        }
        if let Some(workers) = config::env_parse("INGEST_WORKERS")? {
            settings.workers = workers;
        }

        let client_id = config::env_parse::<String>("GMAIL_CLIENT_ID")?;
        let client_secret = config::env_parse::<String>("GMAIL_CLIENT_SECRET")?;
        if let (Some(id), Some(secret)) = (client_id, client_secret) {
            settings.oauth = Some(OAuthClientConfig::new(id, secret));
        }

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.fetch.validate()?;
        if self.workers == 0 {
            bail!("workers must be positive");
        }
        if self.sync.page_size == 0 || self.sync.page_size > GmailClient::MAX_PAGE_SIZE {
            bail!(
                "page_size must be between 1 and {}",
                GmailClient::MAX_PAGE_SIZE
            );
        }
        Ok(())
    }

    /// OAuth client registration, required by token refresh
    pub fn oauth_client(&self) -> Result<&OAuthClientConfig> {
        self.oauth
            .as_ref()
            .context("OAuth client not configured (set GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = IngestSettings::default();
        assert_eq!(settings.fetch.base_url, "https://gmail.googleapis.com/gmail/v1");
        assert_eq!(settings.fetch.requests_per_second, 50);
        assert_eq!(settings.fetch.concurrency, 20);
        assert_eq!(settings.fetch.timeout(), Duration::from_secs(30));
        assert_eq!(settings.fetch.retry_policy().max_attempts, 8);
        assert_eq!(settings.workers, 2);
        assert!(settings.validate().is_ok());

        let scopes: Vec<&str> = settings.sync.scopes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(scopes, vec!["inbox", "sent"]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = IngestSettings::from_json(
            r#"{
                "database_path": "/tmp/ingest.db",
                "fetch": { "requests_per_second": 5 },
                "oauth": { "client_id": "id", "client_secret": "secret" }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.database_path, PathBuf::from("/tmp/ingest.db"));
        assert_eq!(settings.fetch.requests_per_second, 5);
        assert_eq!(settings.fetch.concurrency, 20);
        assert_eq!(settings.oauth_client().unwrap().token_url, GOOGLE_TOKEN_URL);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.json");
        std::fs::write(&path, r#"{ "workers": 6, "sync": { "page_size": 100 } }"#).unwrap();

        let settings = IngestSettings::from_file(&path).unwrap();
        assert_eq!(settings.workers, 6);
        assert_eq!(settings.sync.page_size, 100);
        assert_eq!(settings.sync.scopes.len(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = IngestSettings::default();
        settings.fetch.base_url = "not a url".to_string();
        assert!(settings.validate().is_err());

        let mut settings = IngestSettings::default();
        settings.fetch.concurrency = 0;
        assert!(settings.validate().is_err());

        let mut settings = IngestSettings::default();
        settings.sync.page_size = 501;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_oauth_client() {
        let err = IngestSettings::default().oauth_client().unwrap_err();
        assert!(err.to_string().contains("GMAIL_CLIENT_ID"));
    }

    #[test]
    fn test_secret_not_in_debug() {
        let oauth = OAuthClientConfig::new("id", "very-secret");
        assert!(!format!("{:?}", oauth).contains("very-secret"));
    }

    #[test]
    fn test_query_for_scope() {
        let options = SyncOptions::default();
        let query = options.query_for(&MailboxScope::sent());
        assert_eq!(query.label_ids, vec!["SENT".to_string()]);
        assert_eq!(query.page_size, 500);
        assert!(!query.include_spam_trash);
    }
}
