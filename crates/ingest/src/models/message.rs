//! Transient message values produced by a sync run
//!
//! Neither pages nor records are persisted by the ingestion core. Records are
//! handed to a [`MessageSink`](crate::sync::MessageSink) once per page.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One pagination step: the ids listed by a single list request, in
/// provider order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub ids: Vec<MessageId>,
    /// Provider's estimate of the total result size, when reported
    pub result_size_estimate: Option<u32>,
}

impl MessagePage {
    pub fn new(ids: Vec<MessageId>) -> Self {
        Self {
            ids,
            result_size_estimate: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A fetched message representation keyed by provider id.
///
/// The body is kept as the provider's JSON document; interpreting it is the
/// job of whichever sink eventually persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub raw: serde_json::Value,
}

impl MessageRecord {
    pub fn new(id: MessageId, raw: serde_json::Value) -> Self {
        Self { id, raw }
    }

    /// Provider thread id, if the representation carries one
    pub fn thread_id(&self) -> Option<&str> {
        self.raw.get("threadId").and_then(|v| v.as_str())
    }
}

/// Detail level requested for each fetched message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Full,
    Metadata,
    Minimal,
    Raw,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Full => "full",
            MessageFormat::Metadata => "metadata",
            MessageFormat::Minimal => "minimal",
            MessageFormat::Raw => "raw",
        }
    }
}
