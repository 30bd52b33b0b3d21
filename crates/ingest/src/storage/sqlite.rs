//! SQLite-backed storage for accounts, credentials and sync jobs

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{AccountStore, CredentialStore, JobStore};
use crate::error::IngestError;
use crate::models::{AccountId, Credential, JobId, JobKey, MailAccount, ProviderKind, SyncJob};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE email_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE credentials (
                account_id TEXT PRIMARY KEY,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                refresh_token_expires_at TEXT,
                provider_user_id TEXT UNIQUE,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES email_accounts(id) ON DELETE CASCADE
            );

            CREATE TABLE sync_jobs (
                id TEXT PRIMARY KEY,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                progress_current INTEGER NOT NULL DEFAULT 0,
                progress_total INTEGER,
                error_message TEXT,
                idempotency_key TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX idx_sync_jobs_resource
                ON sync_jobs(resource_type, resource_id, job_type);

            -- At most one active job per (resource_type, resource_id, job_type)
            CREATE UNIQUE INDEX idx_sync_jobs_one_active
                ON sync_jobs(resource_type, resource_id, job_type)
                WHERE status IN ('queued', 'running');
            "#,
        ),
    ])
}

const JOB_COLUMNS: &str = "id, resource_type, resource_id, job_type, status, progress_current, \
     progress_total, error_message, idempotency_key, created_at, updated_at, completed_at";

fn to_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T>(raw: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let id: String = row.get(0)?;
    let id = id.parse::<JobId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SyncJob {
        id,
        resource_type: parse_enum(row.get(1)?)?,
        resource_id: row.get(2)?,
        job_type: parse_enum(row.get(3)?)?,
        status: parse_enum(row.get(4)?)?,
        progress_current: row.get::<_, i64>(5)? as u64,
        progress_total: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
        error_message: row.get(7)?,
        idempotency_key: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?)?,
        updated_at: parse_ts(&row.get::<_, String>(10)?)?,
        completed_at: parse_opt_ts(row.get(11)?)?,
    })
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        account_id: AccountId::new(row.get::<_, String>(0)?),
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        expires_at: parse_opt_ts(row.get(3)?)?,
        refresh_token_expires_at: parse_opt_ts(row.get(4)?)?,
        provider_user_id: row.get(5)?,
        updated_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn load_job(conn: &Connection, id: &JobId) -> Result<Option<SyncJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {} FROM sync_jobs WHERE id = ?", JOB_COLUMNS),
            [id.to_string()],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

fn find_active(conn: &Connection, key: &JobKey) -> Result<Option<SyncJob>> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {} FROM sync_jobs
                 WHERE resource_type = ? AND resource_id = ? AND job_type = ?
                   AND status IN ('queued', 'running')
                 ORDER BY created_at ASC
                 LIMIT 1",
                JOB_COLUMNS
            ),
            params![key.resource_type.as_str(), key.resource_id, key.job_type.as_str()],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

fn insert_job(conn: &Connection, job: &SyncJob) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO sync_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ),
        params![
            job.id.to_string(),
            job.resource_type.as_str(),
            job.resource_id,
            job.job_type.as_str(),
            job.status.as_str(),
            job.progress_current as i64,
            job.progress_total.map(|t| t as i64),
            job.error_message,
            job.idempotency_key,
            to_text(job.created_at),
            to_text(job.updated_at),
            job.completed_at.map(to_text),
        ],
    )?;
    Ok(())
}

fn write_job(conn: &Connection, job: &SyncJob) -> Result<()> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?, progress_current = ?, progress_total = ?, error_message = ?,
            idempotency_key = ?, updated_at = ?, completed_at = ?
         WHERE id = ?",
        params![
            job.status.as_str(),
            job.progress_current as i64,
            job.progress_total.map(|t| t as i64),
            job.error_message,
            job.idempotency_key,
            to_text(job.updated_at),
            job.completed_at.map(to_text),
            job.id.to_string(),
        ],
    )?;
    Ok(())
}

/// SQLite storage for the ingestion pipeline
///
/// One connection behind a mutex; every trait method runs in its own
/// transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets pollers read job rows while a run is writing progress.
        // busy_timeout covers a second process holding the write lock.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // rusqlite rolls back an unfinished transaction on drop, so the
        // connection is consistent even if a holder panicked.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition<F>(&self, id: &JobId, apply: F) -> Result<SyncJob>
    where
        F: FnOnce(&mut SyncJob) -> Result<(), IngestError>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut job = load_job(&tx, id)?.ok_or(IngestError::JobNotFound(*id))?;
        apply(&mut job)?;
        write_job(&tx, &job)?;
        tx.commit()?;
        Ok(job)
    }
}

impl JobStore for SqliteStore {
    fn get_or_create_active_job(&self, key: &JobKey) -> Result<(SyncJob, bool)> {
        let mut conn = self.lock();
        // IMMEDIATE takes the write lock before the read, so a second
        // process cannot observe "no active job" between our check and insert.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_active(&tx, key)? {
            return Ok((existing, false));
        }

        let job = SyncJob::queued(key);
        insert_job(&tx, &job).context("Failed to create sync job")?;
        tx.commit()?;
        Ok((job, true))
    }

    fn find_active_job(&self, key: &JobKey) -> Result<Option<SyncJob>> {
        let conn = self.lock();
        find_active(&conn, key)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<SyncJob>> {
        let conn = self.lock();
        load_job(&conn, id)
    }

    fn mark_running(&self, id: &JobId, idempotency_key: Option<&str>) -> Result<SyncJob> {
        self.transition(id, |job| job.start(idempotency_key))
    }

    fn update_progress(&self, id: &JobId, current: u64, total: Option<u64>) -> Result<()> {
        self.transition(id, |job| job.record_progress(current, total))?;
        Ok(())
    }

    fn mark_succeeded(&self, id: &JobId) -> Result<SyncJob> {
        self.transition(id, |job| job.succeed())
    }

    fn mark_failed(&self, id: &JobId, message: &str) -> Result<SyncJob> {
        self.transition(id, |job| job.fail(message))
    }
}

impl AccountStore for SqliteStore {
    fn get_account(&self, id: &AccountId) -> Result<Option<MailAccount>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, email, provider, created_at FROM email_accounts WHERE id = ?",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, user_id, email, provider, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(MailAccount {
            id: AccountId::new(id),
            user_id,
            email,
            // Keeps the UnsupportedProvider error for unknown tags
            provider: provider.parse::<ProviderKind>()?,
            created_at: parse_ts(&created_at)?,
        }))
    }

    fn upsert_account(&self, account: MailAccount) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO email_accounts (id, user_id, email, provider, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                email = excluded.email,
                provider = excluded.provider",
            params![
                account.id.as_str(),
                account.user_id,
                account.email,
                account.provider.as_str(),
                to_text(account.created_at),
            ],
        )?;
        Ok(())
    }
}

impl CredentialStore for SqliteStore {
    fn load_credential(&self, account_id: &AccountId) -> Result<Option<Credential>> {
        let conn = self.lock();
        let credential = conn
            .query_row(
                "SELECT account_id, access_token, refresh_token, expires_at,
                        refresh_token_expires_at, provider_user_id, updated_at
                 FROM credentials WHERE account_id = ?",
                [account_id.as_str()],
                credential_from_row,
            )
            .optional()?;
        Ok(credential)
    }

    fn find_by_provider_user_id(&self, provider_user_id: &str) -> Result<Option<Credential>> {
        let conn = self.lock();
        let credential = conn
            .query_row(
                "SELECT account_id, access_token, refresh_token, expires_at,
                        refresh_token_expires_at, provider_user_id, updated_at
                 FROM credentials WHERE provider_user_id = ?",
                [provider_user_id],
                credential_from_row,
            )
            .optional()?;
        Ok(credential)
    }

    fn save_credential(&self, credential: Credential) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO credentials
                (account_id, access_token, refresh_token, expires_at,
                 refresh_token_expires_at, provider_user_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                refresh_token_expires_at = excluded.refresh_token_expires_at,
                provider_user_id = excluded.provider_user_id,
                updated_at = excluded.updated_at",
            params![
                credential.account_id.as_str(),
                credential.access_token,
                credential.refresh_token,
                credential.expires_at.map(to_text),
                credential.refresh_token_expires_at.map(to_text),
                credential.provider_user_id,
                to_text(credential.updated_at),
            ],
        )?;
        Ok(())
    }
}
