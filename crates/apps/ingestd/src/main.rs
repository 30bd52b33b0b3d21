//! ingestd - Mailbox ingestion worker
//!
//! Usage:
//!   ingestd sync <account-id> [idempotency-key]
//!   ingestd status <job-id>
//!   ingestd abandon <job-id> [reason]
//!   ingestd refresh <provider-user-id>

use anyhow::{Context, Result, bail};
use ingest::{
    AccountId, AccountStore, CredentialRegistry, CredentialStore, GoogleTokenRefresher,
    IngestSettings, JobId, JobQueue, JobStore, Orchestrator, ProviderRegistry, SqliteStore,
    SyncService, refresh_credential,
};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "usage: ingestd [--config <path>] <sync <account-id> [idempotency-key] | status <job-id> | abandon <job-id> [reason] | refresh <provider-user-id>>";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config directory
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    if let Err(e) = run(std::env::args().skip(1).collect()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(mut args: Vec<String>) -> Result<()> {
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(idx) => {
            if idx + 1 >= args.len() {
                bail!("--config needs a path\n{}", USAGE);
            }
            let path = PathBuf::from(args.remove(idx + 1));
            args.remove(idx);
            Some(path)
        }
        None => None,
    };

    let settings = IngestSettings::load(config_path.as_deref())?;
    let store = Arc::new(
        SqliteStore::new(&settings.database_path)
            .with_context(|| format!("Failed to open {}", settings.database_path.display()))?,
    );
    info!("Using database {}", settings.database_path.display());

    match args.first().map(String::as_str) {
        Some("sync") => {
            let account = args.get(1).context(USAGE)?;
            sync(&settings, store, AccountId::new(account.as_str()), args.get(2).cloned()).await
        }
        Some("status") => {
            let job_id: JobId = args.get(1).context(USAGE)?.parse()?;
            let job = store.get_job(&job_id)?.with_context(|| format!("Sync job {} not found", job_id))?;
            println!("{}", serde_json::to_string_pretty(&job.progress())?);
            Ok(())
        }
        Some("abandon") => {
            let job_id: JobId = args.get(1).context(USAGE)?.parse()?;
            let reason = args.get(2).map(String::as_str).unwrap_or("Abandoned by operator");
            let service = SyncService::new(
                Arc::clone(&store) as Arc<dyn JobStore>,
                Arc::clone(&store) as Arc<dyn AccountStore>,
                Arc::clone(&store) as Arc<dyn CredentialStore>,
                Arc::new(JobQueue::new()),
            );
            let progress = service.abandon_job(&job_id, reason)?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
        Some("refresh") => {
            let provider_user_id = args.get(1).context(USAGE)?;
            let refresher = GoogleTokenRefresher::new(settings.oauth_client()?.clone());
            let credential = refresh_credential(store.as_ref(), &refresher, provider_user_id).await?;
            println!(
                "Refreshed account {} (expires {})",
                credential.account_id,
                credential
                    .expires_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            Ok(())
        }
        _ => bail!(USAGE),
    }
}

/// Submit a sync, run it on the worker pool and poll it to completion
async fn sync(
    settings: &IngestSettings,
    store: Arc<SqliteStore>,
    account_id: AccountId,
    idempotency_key: Option<String>,
) -> Result<()> {
    let providers = ProviderRegistry::with_defaults(settings.fetch.clone());
    let credentials = CredentialRegistry::with_defaults(Arc::clone(&store) as Arc<dyn CredentialStore>);
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&store) as Arc<dyn AccountStore>,
            Arc::new(providers),
            Arc::new(credentials),
        )
        .with_options(settings.sync.clone()),
    );

    let queue = Arc::new(JobQueue::new());
    let workers = queue.spawn_workers(settings.workers, orchestrator);
    let service = SyncService::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&store) as Arc<dyn AccountStore>,
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        Arc::clone(&queue),
    );

    let submission = service.submit(&account_id, idempotency_key.as_deref())?;
    queue.shutdown();
    let job_id = submission.job.id;

    // Another process owns an active job; none of our workers will run it
    if !submission.created {
        println!("{}", serde_json::to_string_pretty(&submission.job.progress())?);
        bail!(
            "Sync job {} is already {} for account {}. If no worker is running it, \
             clear it with `ingestd abandon {}`",
            job_id,
            submission.job.status,
            account_id,
            job_id
        );
    }
    info!("Submitted sync job {}", job_id);

    let mut last_seen = None;
    let progress = loop {
        // Checked before reading the job so a final write is never missed
        let workers_done = workers.iter().all(|w| w.is_finished());
        let progress = service.job_status(&job_id)?;
        if last_seen != Some(progress.progress_current) {
            info!("Job {}: {} ({} messages)", job_id, progress.status, progress.progress_current);
            last_seen = Some(progress.progress_current);
        }
        if progress.status.is_terminal() {
            break progress;
        }
        if workers_done {
            bail!("Workers stopped before sync job {} finished (status {})", job_id, progress.status);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    for worker in workers {
        worker.await.context("Sync worker panicked")?;
    }

    println!("{}", serde_json::to_string_pretty(&progress)?);
    if let Some(message) = progress.error_message {
        bail!("Sync job {} failed: {}", job_id, message);
    }
    Ok(())
}
