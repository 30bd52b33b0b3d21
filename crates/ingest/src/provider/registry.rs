//! Provider tag -> constructor tables

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CredentialSource, MailProvider};
use crate::config::FetchSettings;
use crate::error::IngestError;
use crate::gmail::{GmailCredentialSource, GmailProvider};
use crate::models::ProviderKind;
use crate::storage::CredentialStore;

pub type ProviderFactory = Box<dyn Fn() -> Box<dyn MailProvider> + Send + Sync>;
pub type CredentialFactory = Box<dyn Fn() -> Box<dyn CredentialSource> + Send + Sync>;

fn unsupported(kind: ProviderKind, capability: &'static str) -> IngestError {
    IngestError::UnsupportedProvider {
        provider: kind.to_string(),
        capability,
    }
}

/// Constructors for [`MailProvider`] implementations
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, ProviderFactory>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Gmail provider built from `settings`
    pub fn with_defaults(settings: FetchSettings) -> Self {
        let mut registry = Self::new();
        registry.register(ProviderKind::Gmail, move || {
            Box::new(GmailProvider::new(&settings)) as Box<dyn MailProvider>
        });
        registry
    }

    /// Add or replace the constructor for `kind`
    pub fn register<F>(&mut self, kind: ProviderKind, factory: F)
    where
        F: Fn() -> Box<dyn MailProvider> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn supports(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Construct a provider. Never touches the network.
    pub fn create(&self, kind: ProviderKind) -> Result<Box<dyn MailProvider>, IngestError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| unsupported(kind, "message fetching"))?;
        debug!("Creating {} provider", kind);
        Ok(factory())
    }

    /// Construct a provider from a raw provider tag
    pub fn create_by_tag(&self, tag: &str) -> Result<Box<dyn MailProvider>, IngestError> {
        self.create(tag.parse()?)
    }
}

/// Constructors for [`CredentialSource`] implementations
#[derive(Default)]
pub struct CredentialRegistry {
    factories: HashMap<ProviderKind, CredentialFactory>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Gmail credential source reading from `store`
    pub fn with_defaults(store: Arc<dyn CredentialStore>) -> Self {
        let mut registry = Self::new();
        registry.register(ProviderKind::Gmail, move || {
            Box::new(GmailCredentialSource::new(Arc::clone(&store))) as Box<dyn CredentialSource>
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ProviderKind, factory: F)
    where
        F: Fn() -> Box<dyn CredentialSource> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn supports(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn create(&self, kind: ProviderKind) -> Result<Box<dyn CredentialSource>, IngestError> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| unsupported(kind, "credentials"))?;
        Ok(factory())
    }

    pub fn create_by_tag(&self, tag: &str) -> Result<Box<dyn CredentialSource>, IngestError> {
        self.create(tag.parse()?)
    }
}
