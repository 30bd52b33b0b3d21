//! Gmail API integration
//!
//! This module provides:
//! - A rate-limited, retrying client for the Gmail messages API
//! - The Gmail provider and credential strategies
//! - Access token refresh against Google's token endpoint

mod auth;
mod client;
mod limiter;
mod retry;
mod strategy;
mod transport;

pub use auth::{GoogleTokenRefresher, TokenRefresher, TokenResponse, apply_token_response, refresh_credential};
pub use client::GmailClient;
pub use limiter::{RateLimiter, RatePermit};
pub use retry::{RETRYABLE_STATUS, RetryPolicy, is_retryable_status};
pub use strategy::{GmailCredentialSource, GmailProvider};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, UreqTransport};

/// Gmail API response types
pub mod api {
    use serde::Deserialize;

    /// Response from listing messages
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: Option<String>,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_list_response_last_page() {
            let body = r#"{"messages":[{"id":"a","threadId":"t"}],"resultSizeEstimate":1}"#;
            let parsed: ListMessagesResponse = serde_json::from_str(body).unwrap();
            assert_eq!(parsed.messages.unwrap()[0].id, "a");
            assert!(parsed.next_page_token.is_none());
            assert_eq!(parsed.result_size_estimate, Some(1));
        }

        #[test]
        fn test_list_response_empty_mailbox() {
            let parsed: ListMessagesResponse =
                serde_json::from_str(r#"{"resultSizeEstimate":0}"#).unwrap();
            assert!(parsed.messages.is_none());
        }
    }
}
