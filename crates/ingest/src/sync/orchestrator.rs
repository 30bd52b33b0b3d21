//! One mailbox sync run, end to end
//!
//! `run` drives a queued job to exactly one terminal state. Every failure
//! after the job is marked running is caught here, written to the job as
//! `failed` with its message, and returned as [`SyncOutcome::Error`].
//! Progress already recorded is never rolled back.
//!
//! The stores are synchronous, so their calls run on the blocking pool
//! rather than on a runtime worker.

use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::sink::{DiscardSink, MessageSink};
use crate::config::SyncOptions;
use crate::error::IngestError;
use crate::models::{AccountId, JobId};
use crate::provider::{
    CredentialRegistry, CredentialSource, MailProvider, ProviderAuth, ProviderRegistry,
};
use crate::storage::{AccountStore, JobStore};

/// Result of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncOutcome {
    Success { message_count: u64 },
    Error { message: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }
}

/// Run a synchronous store call on the blocking pool
async fn blocking<T, F>(call: F) -> Result<T, IngestError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| IngestError::Store(anyhow::anyhow!("Store call did not complete: {}", e)))?
        .map_err(IngestError::from)
}

/// Holds the provider for one run so it is closed on every exit path
struct ProviderSlot {
    provider: Option<Box<dyn MailProvider>>,
}

impl ProviderSlot {
    fn empty() -> Self {
        Self { provider: None }
    }

    fn fill(&mut self, provider: Box<dyn MailProvider>) -> &dyn MailProvider {
        &**self.provider.insert(provider)
    }

    /// Close the provider if one was created. Idempotent.
    async fn release(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.close().await
        {
            warn!("Failed to close {} provider: {}", provider.provider(), e);
        }
    }
}

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStore>,
    providers: Arc<ProviderRegistry>,
    credentials: Arc<CredentialRegistry>,
    sink: Arc<dyn MessageSink>,
    options: SyncOptions,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStore>,
        providers: Arc<ProviderRegistry>,
        credentials: Arc<CredentialRegistry>,
    ) -> Self {
        Self {
            jobs,
            accounts,
            providers,
            credentials,
            sink: Arc::new(DiscardSink),
            options: SyncOptions::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    async fn with_jobs<T, F>(&self, call: F) -> Result<T, IngestError>
    where
        F: FnOnce(&dyn JobStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let jobs = Arc::clone(&self.jobs);
        blocking(move || call(jobs.as_ref())).await
    }

    /// Run the sync job `job_id` for `account_id`
    pub async fn run(
        &self,
        job_id: &JobId,
        account_id: &AccountId,
        idempotency_key: Option<&str>,
    ) -> SyncOutcome {
        // A job that cannot be started belongs to someone else or is finished;
        // leave its state alone
        let id = *job_id;
        let key = idempotency_key.map(str::to_string);
        let started = self
            .with_jobs(move |jobs| jobs.mark_running(&id, key.as_deref()))
            .await;
        if let Err(e) = started {
            error!("Sync job {} could not be started: {:#}", job_id, e);
            return SyncOutcome::Error {
                message: e.to_string(),
            };
        }
        info!("Sync job {} running for account {}", job_id, account_id);

        let mut slot = ProviderSlot::empty();
        let result = self.execute(job_id, account_id, &mut slot).await;
        slot.release().await;

        match result {
            Ok(message_count) => {
                info!("Sync job {} succeeded with {} messages", job_id, message_count);
                SyncOutcome::Success { message_count }
            }
            Err(e) => {
                let message = e.to_string();
                error!("Sync job {} failed: {}", job_id, message);
                // Each store call is its own unit, so this works even if
                // the failure came from the store
                let failed = message.clone();
                let marked = self
                    .with_jobs(move |jobs| jobs.mark_failed(&id, &failed))
                    .await;
                if let Err(store_err) = marked {
                    error!("Could not mark sync job {} failed: {:#}", job_id, store_err);
                }
                SyncOutcome::Error { message }
            }
        }
    }

    async fn execute(
        &self,
        job_id: &JobId,
        account_id: &AccountId,
        slot: &mut ProviderSlot,
    ) -> Result<u64, IngestError> {
        let job_id = *job_id;
        let account = {
            let accounts = Arc::clone(&self.accounts);
            let id = account_id.clone();
            blocking(move || accounts.get_account(&id)).await?
        }
        .ok_or_else(|| IngestError::AccountNotFound(account_id.clone()))?;

        let source: Arc<dyn CredentialSource> = Arc::from(self.credentials.create(account.provider)?);
        let credential = {
            let source = Arc::clone(&source);
            let id = account_id.clone();
            blocking(move || source.load_auth_data(&id)).await?
        }
        .ok_or_else(|| IngestError::CredentialMissing(account_id.clone()))?;

        let now = Utc::now();
        let access_token = credential.ensure_syncable(now)?;
        if credential.is_access_expired(now) {
            warn!(
                "Access token for account {} expired; the provider may reject it",
                account_id
            );
        }

        let user_identifier = source
            .get_user_identifier(&credential)
            .ok_or_else(|| IngestError::UserIdentifierMissing(account_id.clone()))?;
        let auth = ProviderAuth::new(user_identifier, access_token);

        let provider = slot.fill(self.providers.create(account.provider)?);

        let mut total: u64 = 0;
        for scope in &self.options.scopes {
            let query = self.options.query_for(scope);
            let mut pages = provider.list_messages(&auth, &query);
            let mut page_number = 0;

            while let Some(page) = pages.next().await {
                let page = page?;
                page_number += 1;
                if page.is_empty() {
                    debug!("Job {}: empty {} page {}", job_id, scope.name, page_number);
                    continue;
                }

                let records = provider
                    .fetch_messages_by_ids(&page.ids, &auth, self.options.format)
                    .await?;
                self.sink.persist(&records).await?;

                total += records.len() as u64;
                self.with_jobs(move |jobs| jobs.update_progress(&job_id, total, None))
                    .await?;
                info!(
                    "Job {}: {} page {} fetched {} messages ({} total)",
                    job_id,
                    scope.name,
                    page_number,
                    records.len(),
                    total
                );
            }
        }

        self.with_jobs(move |jobs| jobs.mark_succeeded(&job_id)).await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::{
        Credential, JobKey, JobStatus, MailAccount, MessageFormat, MessageId, MessagePage,
        MessageRecord, ProviderKind, SyncJob,
    };
    use crate::provider::{ListQuery, MessagePages};
    use crate::storage::{CredentialStore, InMemoryStore};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::{self, ThreadId};

    /// JobStore that records every progress write
    struct RecordingJobs {
        inner: Arc<InMemoryStore>,
        progress: Mutex<Vec<u64>>,
        threads: Mutex<Vec<ThreadId>>,
    }

    impl JobStore for RecordingJobs {
        fn get_or_create_active_job(&self, key: &JobKey) -> anyhow::Result<(SyncJob, bool)> {
            self.inner.get_or_create_active_job(key)
        }
        fn find_active_job(&self, key: &JobKey) -> anyhow::Result<Option<SyncJob>> {
            self.inner.find_active_job(key)
        }
        fn get_job(&self, id: &JobId) -> anyhow::Result<Option<SyncJob>> {
            self.inner.get_job(id)
        }
        fn mark_running(&self, id: &JobId, key: Option<&str>) -> anyhow::Result<SyncJob> {
            self.inner.mark_running(id, key)
        }
        fn update_progress(&self, id: &JobId, current: u64, total: Option<u64>) -> anyhow::Result<()> {
            self.inner.update_progress(id, current, total)?;
            self.progress.lock().unwrap().push(current);
            self.threads.lock().unwrap().push(thread::current().id());
            Ok(())
        }
        fn mark_succeeded(&self, id: &JobId) -> anyhow::Result<SyncJob> {
            self.inner.mark_succeeded(id)
        }
        fn mark_failed(&self, id: &JobId, message: &str) -> anyhow::Result<SyncJob> {
            self.inner.mark_failed(id, message)
        }
    }

    /// Provider serving page sizes per label
    struct MockProvider {
        pages: HashMap<String, Vec<usize>>,
        fail_on_fetch: Option<usize>,
        fetches: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailProvider for MockProvider {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        fn list_messages<'a>(&'a self, _auth: &'a ProviderAuth, query: &'a ListQuery) -> MessagePages<'a> {
            let label = query.label_ids.first().cloned().unwrap_or_default();
            let sizes = self.pages.get(&label).cloned().unwrap_or_else(|| vec![0]);
            let pages: Vec<Result<MessagePage, FetchError>> = sizes
                .into_iter()
                .enumerate()
                .map(|(p, size)| {
                    Ok(MessagePage::new(
                        (0..size).map(|i| MessageId::new(format!("{}-{}-{}", label, p, i))).collect(),
                    ))
                })
                .collect();
            futures::stream::iter(pages).boxed()
        }

        async fn fetch_messages_by_ids(
            &self,
            ids: &[MessageId],
            _auth: &ProviderAuth,
            _format: MessageFormat,
        ) -> Result<Vec<MessageRecord>, FetchError> {
            let call = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_fetch == Some(call) {
                return Err(FetchError::Status {
                    status: 404,
                    body: "not found".to_string(),
                });
            }
            Ok(ids
                .iter()
                .map(|id| MessageRecord::new(id.clone(), serde_json::json!({ "id": id.as_str() })))
                .collect())
        }

        async fn close(&self) -> Result<(), FetchError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        jobs: Arc<RecordingJobs>,
        constructed: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        orchestrator: Orchestrator,
    }

    const ACCOUNT: &str = "acct-1";

    fn harness(pages: &[(&str, &[usize])], fail_on_fetch: Option<usize>) -> Harness {
        let store = Arc::new(InMemoryStore::default());
        let jobs = Arc::new(RecordingJobs {
            inner: Arc::clone(&store),
            progress: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        });
        let constructed = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let pages: HashMap<String, Vec<usize>> = pages
            .iter()
            .map(|(label, sizes)| (label.to_string(), sizes.to_vec()))
            .collect();

        let mut providers = ProviderRegistry::new();
        {
            let constructed = Arc::clone(&constructed);
            let closed = Arc::clone(&closed);
            providers.register(ProviderKind::Gmail, move || {
                constructed.fetch_add(1, Ordering::SeqCst);
                Box::new(MockProvider {
                    pages: pages.clone(),
                    fail_on_fetch,
                    fetches: AtomicUsize::new(0),
                    closed: Arc::clone(&closed),
                }) as Box<dyn MailProvider>
            });
        }
        let credentials =
            CredentialRegistry::with_defaults(Arc::clone(&store) as Arc<dyn CredentialStore>);

        let orchestrator = Orchestrator::new(
            Arc::clone(&jobs) as Arc<dyn JobStore>,
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::new(providers),
            Arc::new(credentials),
        );

        Harness {
            store,
            jobs,
            constructed,
            closed,
            orchestrator,
        }
    }

    impl Harness {
        fn seed(&self, provider: ProviderKind, credential: Credential) {
            self.store
                .upsert_account(MailAccount::new(ACCOUNT, "user-1", "me@example.com", provider))
                .unwrap();
            self.store.save_credential(credential).unwrap();
        }

        fn queue_job(&self) -> JobId {
            let (job, created) = self
                .jobs
                .get_or_create_active_job(&JobKey::mailbox_sync(ACCOUNT))
                .unwrap();
            assert!(created);
            job.id
        }

        async fn run(&self, job_id: &JobId) -> SyncOutcome {
            self.orchestrator
                .run(job_id, &AccountId::new(ACCOUNT), Some("idem-1"))
                .await
        }

        fn job(&self, job_id: &JobId) -> SyncJob {
            self.store.get_job(job_id).unwrap().unwrap()
        }
    }

    fn valid_credential() -> Credential {
        Credential::new(AccountId::new(ACCOUNT))
            .with_access_token("access", Some(Utc::now() + Duration::hours(1)))
            .with_refresh_token("refresh", Some(Utc::now() + Duration::days(30)))
            .with_provider_user_id("google-1")
    }

    #[tokio::test]
    async fn test_pages_accumulate_with_eager_progress() {
        let h = harness(&[("INBOX", &[500, 500, 120])], None);
        h.seed(ProviderKind::Gmail, valid_credential());
        let job_id = h.queue_job();

        let outcome = h.run(&job_id).await;
        assert_eq!(outcome, SyncOutcome::Success { message_count: 1120 });
        assert_eq!(*h.jobs.progress.lock().unwrap(), vec![500, 1000, 1120]);

        let job = h.job(&job_id);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.progress_current, 1120);
        assert_eq!(job.idempotency_key.as_deref(), Some("idem-1"));
        assert!(job.completed_at.is_some());
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_writes_leave_the_runtime_thread() {
        let h = harness(&[("INBOX", &[2, 2])], None);
        h.seed(ProviderKind::Gmail, valid_credential());
        let job_id = h.queue_job();

        assert!(h.run(&job_id).await.is_success());

        // Current-thread runtime: every task runs on this thread
        let runtime_thread = thread::current().id();
        let threads = h.jobs.threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[tokio::test]
    async fn test_scopes_processed_in_order() {
        let h = harness(&[("INBOX", &[3]), ("SENT", &[2, 1])], None);
        h.seed(ProviderKind::Gmail, valid_credential());
        let job_id = h.queue_job();

        let outcome = h.run(&job_id).await;
        assert_eq!(outcome, SyncOutcome::Success { message_count: 6 });
        assert_eq!(*h.jobs.progress.lock().unwrap(), vec![3, 5, 6]);
    }

    #[tokio::test]
    async fn test_expired_refresh_token_fails_before_provider() {
        let h = harness(&[("INBOX", &[5])], None);
        let expired = valid_credential().with_refresh_token("refresh", Some(Utc::now() - Duration::hours(1)));
        h.seed(ProviderKind::Gmail, expired);
        let job_id = h.queue_job();

        let outcome = h.run(&job_id).await;
        match outcome {
            SyncOutcome::Error { message } => assert!(message.contains("re-authenticate")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
        assert_eq!(h.closed.load(Ordering::SeqCst), 0);
        assert_eq!(h.job(&job_id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_account_marks_failed() {
        let h = harness(&[], None);
        let job_id = h.queue_job();

        let outcome = h.run(&job_id).await;
        assert!(!outcome.is_success());
        let job = h.job(&job_id);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_missing_user_identifier() {
        let h = harness(&[("INBOX", &[1])], None);
        let mut credential = valid_credential();
        credential.provider_user_id = None;
        h.seed(ProviderKind::Gmail, credential);
        let job_id = h.queue_job();

        assert!(!h.run(&job_id).await.is_success());
        assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
        assert_eq!(h.job(&job_id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unsupported_provider_is_configuration_failure() {
        let h = harness(&[("INBOX", &[1])], None);
        h.seed(ProviderKind::Outlook, valid_credential());
        let job_id = h.queue_job();

        match h.run(&job_id).await {
            SyncOutcome::Error { message } => assert!(message.contains("outlook")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
        assert_eq!(h.job(&job_id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_keeps_committed_progress_and_closes_once() {
        let h = harness(&[("INBOX", &[2, 2, 2])], Some(3));
        h.seed(ProviderKind::Gmail, valid_credential());
        let job_id = h.queue_job();

        let outcome = h.run(&job_id).await;
        match outcome {
            SyncOutcome::Error { message } => assert!(message.contains("404")),
            other => panic!("unexpected outcome {:?}", other),
        }

        let job = h.job(&job_id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress_current, 4);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_not_startable_is_left_alone() {
        let h = harness(&[("INBOX", &[1])], None);
        h.seed(ProviderKind::Gmail, valid_credential());
        let job_id = h.queue_job();
        h.jobs.mark_running(&job_id, None).unwrap();

        assert!(!h.run(&job_id).await.is_success());
        assert_eq!(h.job(&job_id).status, JobStatus::Running);
        assert_eq!(h.constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_outcome_serialization() {
        let success = serde_json::to_value(SyncOutcome::Success { message_count: 3 }).unwrap();
        assert_eq!(success, serde_json::json!({ "status": "success", "message_count": 3 }));

        let error = serde_json::to_value(SyncOutcome::Error {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(error, serde_json::json!({ "status": "error", "message": "boom" }));
    }
}
