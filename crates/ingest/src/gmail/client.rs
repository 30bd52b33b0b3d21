//! Rate-limited Gmail API client
//!
//! Every network call goes through [`GmailClient::get_with_backoff`], which
//! retries rate-limit and upstream statuses as well as transient transport
//! failures. Detail requests are additionally gated per request by a
//! concurrency semaphore and a sliding-window rate limiter.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;

use super::api::ListMessagesResponse;
use super::limiter::RateLimiter;
use super::retry::{RetryPolicy, is_retryable_status};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::config::FetchSettings;
use crate::error::FetchError;
use crate::models::{MessageFormat, MessageId, MessagePage, MessageRecord};
use crate::provider::{ListQuery, MessagePages};

/// Gmail API client for listing and fetching messages
pub struct GmailClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    slots: Arc<Semaphore>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    closed: AtomicBool,
}

enum Cursor {
    First,
    Next(String),
    Done,
}

impl GmailClient {
    /// Gmail API base URL
    pub const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Gmail caps `maxResults` for message listing at 500
    pub const MAX_PAGE_SIZE: u32 = 500;

    pub fn new(settings: &FetchSettings, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            transport,
            slots: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            limiter: RateLimiter::per_second(settings.requests_per_second),
            retry: settings.retry_policy(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn ensure_open(&self) -> Result<(), FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FetchError::Closed);
        }
        Ok(())
    }

    fn messages_url(&self, user_id: &str) -> String {
        format!(
            "{}/users/{}/messages",
            self.base_url,
            urlencoding::encode(user_id)
        )
    }

    /// Issue a GET, retrying transient outcomes with exponential backoff.
    ///
    /// Exhaustion re-raises the last transient transport error if one was
    /// seen, otherwise reports [`FetchError::RetriesExhausted`].
    pub async fn get_with_backoff(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_transport: Option<TransportError> = None;
        let mut last_status = 0;

        for attempt in 0..max_attempts {
            self.ensure_open()?;

            match self.transport.get(request.clone()).await {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status) => {
                    last_status = response.status;
                    warn!(
                        "GET {} returned {} (attempt {}/{})",
                        request.url,
                        response.status,
                        attempt + 1,
                        max_attempts
                    );
                }
                Ok(response) => {
                    return Err(FetchError::Status {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        "GET {} failed: {} (attempt {}/{})",
                        request.url,
                        err,
                        attempt + 1,
                        max_attempts
                    );
                    last_transport = Some(err);
                }
                Err(err) => return Err(err.into()),
            }

            if attempt + 1 < max_attempts {
                let delay = self.retry.delay_for(attempt);
                debug!("Backing off {:?} before retrying {}", delay, request.url);
                tokio::time::sleep(delay).await;
            }
        }

        match last_transport {
            Some(err) => Err(FetchError::Transport(err)),
            None => Err(FetchError::RetriesExhausted {
                attempts: max_attempts,
                last_status,
            }),
        }
    }

    /// Fetch one page of the message listing
    async fn list_page(
        &self,
        user_id: &str,
        access_token: &str,
        query: &ListQuery,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, FetchError> {
        let mut request = HttpRequest::get(self.messages_url(user_id), access_token)
            .query(
                "maxResults",
                query.page_size.clamp(1, Self::MAX_PAGE_SIZE).to_string(),
            )
            .query("includeSpamTrash", query.include_spam_trash.to_string());
        for label in &query.label_ids {
            request = request.query("labelIds", label.as_str());
        }
        if let Some(token) = page_token {
            request = request.query("pageToken", token);
        }

        let response = self.get_with_backoff(request).await?;
        Ok(serde_json::from_str(&response.body)?)
    }

    /// List message ids page by page.
    ///
    /// The stream is lazy: each page is requested when polled, and it ends
    /// after the first page that carries no `nextPageToken`. Calling this
    /// again starts over from the first page.
    pub fn list_messages<'a>(
        &'a self,
        user_id: &'a str,
        access_token: &'a str,
        query: &'a ListQuery,
    ) -> MessagePages<'a> {
        futures::stream::try_unfold(Cursor::First, move |cursor| async move {
            let page_token = match cursor {
                Cursor::Done => return Ok(None),
                Cursor::First => None,
                Cursor::Next(token) => Some(token),
            };

            let response = self
                .list_page(user_id, access_token, query, page_token.as_deref())
                .await?;

            let ids: Vec<MessageId> = response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter(|m| !m.id.is_empty())
                .map(|m| MessageId::new(m.id))
                .collect();
            debug!("Listed {} message ids for {}", ids.len(), user_id);

            let next = match response.next_page_token {
                Some(token) if !token.is_empty() => Cursor::Next(token),
                _ => Cursor::Done,
            };
            let page = MessagePage {
                ids,
                result_size_estimate: response.result_size_estimate,
            };
            Ok(Some((page, next)))
        })
        .boxed()
    }

    /// Fetch one message under both gates
    async fn fetch_one(
        &self,
        id: &MessageId,
        user_id: &str,
        access_token: &str,
        format: MessageFormat,
    ) -> Result<MessageRecord, FetchError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let _rate = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let url = format!(
            "{}/{}",
            self.messages_url(user_id),
            urlencoding::encode(id.as_str())
        );
        let request = HttpRequest::get(url, access_token).query("format", format.as_str());
        let response = self.get_with_backoff(request).await;
        drop(slot);

        let raw: serde_json::Value = serde_json::from_str(&response?.body)?;
        Ok(MessageRecord::new(id.clone(), raw))
    }

    /// Fetch many messages concurrently.
    ///
    /// The i-th record corresponds to the i-th id regardless of completion
    /// order. The first failure aborts the batch.
    pub async fn fetch_messages_by_ids(
        &self,
        ids: &[MessageId],
        user_id: &str,
        access_token: &str,
        format: MessageFormat,
    ) -> Result<Vec<MessageRecord>, FetchError> {
        self.ensure_open()?;

        let mut pending: FuturesUnordered<_> = ids
            .iter()
            .enumerate()
            .map(|(idx, id)| async move {
                self.fetch_one(id, user_id, access_token, format)
                    .await
                    .map(|record| (idx, record))
            })
            .collect();

        let mut slots: Vec<Option<MessageRecord>> = (0..ids.len()).map(|_| None).collect();
        while let Some(result) = pending.next().await {
            let (idx, record) = result?;
            slots[idx] = Some(record);
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Release the client's gates. Must be called exactly once; any later
    /// call, including a second close, fails with [`FetchError::Closed`].
    pub fn close(&self) -> Result<(), FetchError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(FetchError::Closed);
        }
        self.slots.close();
        self.limiter.close();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Reply = (Duration, Result<HttpResponse, TransportError>);

    /// Transport answering from per-path scripts; the last reply of a
    /// script repeats once the script runs out
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        requests: Mutex<Vec<HttpRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn script(&self, path: &str, replies: Vec<Reply>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(path.to_string(), replies.into());
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let path = request.url.trim_start_matches("https://gmail.test").to_string();
            self.requests.lock().unwrap().push(request);

            let (delay, reply) = {
                let mut scripts = self.scripts.lock().unwrap();
                let script = scripts.get_mut(&path).expect("unscripted path");
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            reply
        }
    }

    fn ok(body: serde_json::Value) -> Reply {
        (Duration::ZERO, Ok(HttpResponse::new(200, body.to_string())))
    }

    fn status(code: u16) -> Reply {
        (Duration::ZERO, Ok(HttpResponse::new(code, "{}")))
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            base_url: "https://gmail.test".to_string(),
            requests_per_second: 1000,
            concurrency: 4,
            ..FetchSettings::default()
        }
    }

    fn client(transport: &Arc<ScriptedTransport>) -> GmailClient {
        GmailClient::new(&settings(), Arc::clone(transport) as Arc<dyn HttpTransport>)
    }

    const DETAIL_A: &str = "/users/me/messages/a";

    #[tokio::test(start_paused = true)]
    async fn test_seven_retryable_outcomes_then_success() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut replies: Vec<Reply> = [429, 503, 500, 403, 502, 504, 429]
            .into_iter()
            .map(status)
            .collect();
        replies.push(ok(serde_json::json!({ "id": "a" })));
        transport.script(DETAIL_A, replies);

        let client = client(&transport);
        let records = client
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id.as_str(), "a");
        assert_eq!(transport.calls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_then_success() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            DETAIL_A,
            vec![
                (Duration::ZERO, Err(TransportError::Timeout("read".into()))),
                (Duration::ZERO, Err(TransportError::Protocol("reset".into()))),
                ok(serde_json::json!({ "id": "a" })),
            ],
        );

        let records = client(&transport)
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eight_retryable_statuses_exhaust() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(DETAIL_A, vec![status(429)]);

        let err = client(&transport)
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::RetriesExhausted {
                attempts: 8,
                last_status: 429
            }
        ));
        assert_eq!(transport.calls(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reraises_last_transport_error() {
        let transport = Arc::new(ScriptedTransport::default());
        let mut replies = vec![(Duration::ZERO, Err(TransportError::Connect("refused".into())))];
        replies.extend((0..7).map(|_| status(503)));
        transport.script(DETAIL_A, replies);

        let err = client(&transport)
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport(TransportError::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_total_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(DETAIL_A, vec![status(500)]);
        let start = tokio::time::Instant::now();

        let _ = client(&transport)
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await;

        // Seven sleeps between eight attempts: 0.5+1+2+4+8+16+32 = 63.5s,
        // plus under 0.25s of jitter each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(63_500), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(63_500 + 7 * 250), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_immediately() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(DETAIL_A, vec![(Duration::ZERO, Ok(HttpResponse::new(404, "gone")))]);

        let err = client(&transport)
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_preserves_input_order() {
        let transport = Arc::new(ScriptedTransport::default());
        // b answers first, a last
        transport.script(
            "/users/me/messages/a",
            vec![(Duration::from_millis(300), Ok(HttpResponse::new(200, r#"{"id":"a"}"#)))],
        );
        transport.script(
            "/users/me/messages/b",
            vec![(Duration::from_millis(10), Ok(HttpResponse::new(200, r#"{"id":"b"}"#)))],
        );
        transport.script(
            "/users/me/messages/c",
            vec![(Duration::from_millis(100), Ok(HttpResponse::new(200, r#"{"id":"c"}"#)))],
        );

        let ids = vec![MessageId::new("a"), MessageId::new("b"), MessageId::new("c")];
        let records = client(&transport)
            .fetch_messages_by_ids(&ids, "me", "tok", MessageFormat::Metadata)
            .await
            .unwrap();

        let got: Vec<&str> = records.iter().map(|r| r.raw["id"].as_str().unwrap()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);

        let requests = transport.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.query_value("format") == Some("metadata")));
        assert!(requests.iter().all(|r| r.bearer == "tok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let transport = Arc::new(ScriptedTransport::default());
        let ids: Vec<MessageId> = (0..12).map(|i| MessageId::new(format!("m{}", i))).collect();
        for id in &ids {
            transport.script(
                &format!("/users/me/messages/{}", id),
                vec![(
                    Duration::from_millis(50),
                    Ok(HttpResponse::new(200, format!(r#"{{"id":"{}"}}"#, id))),
                )],
            );
        }

        let records = client(&transport)
            .fetch_messages_by_ids(&ids, "me", "tok", MessageFormat::Full)
            .await
            .unwrap();
        assert_eq!(records.len(), 12);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 4);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_messages_paginates_until_no_token() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            "/users/me/messages",
            vec![
                ok(serde_json::json!({
                    "messages": [{ "id": "1", "threadId": "t" }, { "id": "2", "threadId": "t" }],
                    "nextPageToken": "p2",
                    "resultSizeEstimate": 3
                })),
                ok(serde_json::json!({ "messages": [{ "id": "3", "threadId": "t" }] })),
            ],
        );

        let client = client(&transport);
        let query = ListQuery {
            page_size: 2,
            include_spam_trash: false,
            label_ids: vec!["INBOX".to_string()],
        };
        let pages: Vec<MessagePage> = client
            .list_messages("me", "tok", &query)
            .map(|p| p.unwrap())
            .collect()
            .await;

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].ids, vec![MessageId::new("1"), MessageId::new("2")]);
        assert_eq!(pages[0].result_size_estimate, Some(3));
        assert_eq!(pages[1].ids, vec![MessageId::new("3")]);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query_value("pageToken"), None);
        assert_eq!(requests[0].query_value("maxResults"), Some("2"));
        assert_eq!(requests[0].query_value("includeSpamTrash"), Some("false"));
        assert_eq!(requests[0].query_value("labelIds"), Some("INBOX"));
        assert_eq!(requests[1].query_value("pageToken"), Some("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_messages_is_lazy() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(
            "/users/me/messages",
            vec![ok(serde_json::json!({ "messages": [{ "id": "1", "threadId": "t" }], "nextPageToken": "more" }))],
        );

        let client = client(&transport);
        let query = ListQuery::default();
        let mut pages = client.list_messages("me", "tok", &query);
        assert_eq!(transport.calls(), 0);

        pages.next().await.unwrap().unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_mailbox_yields_one_empty_page() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script("/users/me/messages", vec![ok(serde_json::json!({ "resultSizeEstimate": 0 }))]);

        let client = client(&transport);
        let query = ListQuery::default();
        let pages: Vec<_> = client.list_messages("me", "tok", &query).collect().await;
        assert_eq!(pages.len(), 1);
        assert!(pages[0].as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.script(DETAIL_A, vec![ok(serde_json::json!({ "id": "a" }))]);

        let client = client(&transport);
        tokio_test::assert_ok!(client.close());
        assert!(client.is_closed());

        let err = client
            .fetch_messages_by_ids(&[MessageId::new("a")], "me", "tok", MessageFormat::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Closed));
        assert!(matches!(client.close(), Err(FetchError::Closed)));
        assert_eq!(transport.calls(), 0);
    }
}
