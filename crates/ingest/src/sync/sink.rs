//! Destination for fetched message records

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::models::MessageRecord;

/// Receives each fetched page of records before progress is recorded
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist(&self, records: &[MessageRecord]) -> Result<()>;
}

/// Sink that drops every batch
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl MessageSink for DiscardSink {
    async fn persist(&self, records: &[MessageRecord]) -> Result<()> {
        debug!("Discarding batch of {} messages", records.len());
        Ok(())
    }
}
