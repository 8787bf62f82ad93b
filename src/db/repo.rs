use super::model::{ClaimOutcome, ClaimRequest, StatusCount};
use crate::model::{
    ClassificationResult, InboundMessage, IntentLabel, ProcessingRecord, ProcessingStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Statuses a record may be (re)claimed from.
const OPEN_STATUSES: &str = "('pending', 'failed', 'classified')";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL + FULL sync: a Responded row must survive a crash right after send.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePool::connect_with(options)
        .await
        .context("failed to open transaction store")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> i64 {
    now.timestamp_millis() + lease.as_millis() as i64
}

/// Atomically claim `msg` for this run.
///
/// A fresh id is inserted as Pending. An existing unfinished record is taken
/// over only when it is below the attempt limit and no other run holds a
/// live lease on it; a Failed record returns to Pending, a Classified one
/// stays Classified so only the send is retried.
#[instrument(skip_all, fields(message_id = %msg.message_id))]
pub async fn claim(pool: &Pool, msg: &InboundMessage, req: &ClaimRequest<'_>) -> Result<ClaimOutcome> {
    let now = Utc::now();
    let deadline = lease_deadline(now, req.lease);

    let inserted = sqlx::query(
        "INSERT INTO processing_records \
            (message_id, status, attempt_count, terminal, thread_id, sender_address, subject, body, \
             received_at, claimed_by, lease_expires_at, created_at, updated_at) \
         VALUES (?, 'pending', 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(message_id) DO NOTHING",
    )
    .bind(&msg.message_id)
    .bind(&msg.thread_id)
    .bind(&msg.sender_address)
    .bind(&msg.subject)
    .bind(&msg.body)
    .bind(msg.received_at)
    .bind(req.run_id)
    .bind(deadline)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("claim insert failed")?
    .rows_affected();

    if inserted == 1 {
        let record = get_record(pool, &msg.message_id)
            .await?
            .ok_or_else(|| anyhow!("claimed record {} vanished", msg.message_id))?;
        return Ok(ClaimOutcome::Claimed(record));
    }

    reclaim(pool, &msg.message_id, req).await
}

/// Take over an existing unfinished record; see [`claim`].
#[instrument(skip_all, fields(message_id = %message_id))]
pub async fn reclaim(pool: &Pool, message_id: &str, req: &ClaimRequest<'_>) -> Result<ClaimOutcome> {
    let now = Utc::now();
    let sql = format!(
        "UPDATE processing_records \
         SET status = CASE WHEN status = 'failed' THEN 'pending' ELSE status END, \
             claimed_by = ?, lease_expires_at = ?, updated_at = ? \
         WHERE message_id = ? AND status IN {OPEN_STATUSES} AND terminal = 0 \
           AND attempt_count < ? \
           AND (lease_expires_at IS NULL OR lease_expires_at <= ?)"
    );
    let updated = sqlx::query(&sql)
        .bind(req.run_id)
        .bind(lease_deadline(now, req.lease))
        .bind(now)
        .bind(message_id)
        .bind(req.max_attempts)
        .bind(now.timestamp_millis())
        .execute(pool)
        .await
        .context("reclaim update failed")?
        .rows_affected();

    let record = get_record(pool, message_id)
        .await?
        .ok_or_else(|| anyhow!("record {} not found", message_id))?;

    if updated == 1 {
        return Ok(ClaimOutcome::Reclaimed(record));
    }
    if record.status.is_final() {
        return Ok(ClaimOutcome::AlreadyFinal(record));
    }
    if record.terminal || record.attempt_count >= req.max_attempts {
        return Ok(ClaimOutcome::Exhausted(record));
    }
    Ok(ClaimOutcome::InFlight)
}

/// Pending → Classified, persisting the draft so a send retry never reclassifies.
/// Only matches while this run's lease is live, and extends it.
#[instrument(skip_all, fields(message_id = %message_id))]
pub async fn mark_classified(
    pool: &Pool,
    message_id: &str,
    run_id: &str,
    result: &ClassificationResult,
    lease: Duration,
) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE processing_records \
         SET status = 'classified', intent_label = ?, confidence = ?, draft_response = ?, \
             error_detail = NULL, lease_expires_at = ?, updated_at = ? \
         WHERE message_id = ? AND status = 'pending' AND claimed_by = ? \
           AND lease_expires_at > ?",
    )
    .bind(result.intent.as_str())
    .bind(result.confidence)
    .bind(&result.draft_response)
    .bind(lease_deadline(now, lease))
    .bind(now)
    .bind(message_id)
    .bind(run_id)
    .bind(now.timestamp_millis())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Send gate. Renews this run's lease on a Classified record, but only while
/// the current lease is still live; a reply may be sent only when this
/// returns true. No other run can reclaim the record for `lease` afterwards.
#[instrument(skip_all, fields(message_id = %message_id))]
pub async fn begin_send(
    pool: &Pool,
    message_id: &str,
    run_id: &str,
    lease: Duration,
) -> Result<bool> {
    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE processing_records SET lease_expires_at = ?, updated_at = ? \
         WHERE message_id = ? AND status = 'classified' AND claimed_by = ? \
           AND lease_expires_at > ?",
    )
    .bind(lease_deadline(now, lease))
    .bind(now)
    .bind(message_id)
    .bind(run_id)
    .bind(now.timestamp_millis())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Classified → Responded. Only the run holding the claim can make this move,
/// and only once.
#[instrument(skip_all, fields(message_id = %message_id))]
pub async fn mark_responded(pool: &Pool, message_id: &str, run_id: &str) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE processing_records \
         SET status = 'responded', error_detail = NULL, claimed_by = NULL, \
             lease_expires_at = NULL, updated_at = ? \
         WHERE message_id = ? AND status = 'classified' AND claimed_by = ?",
    )
    .bind(Utc::now())
    .bind(message_id)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// Record a send whose outcome is unknown. The record stays Classified with
/// one more attempt; once attempts run out it becomes terminal Failed.
/// Returns the status the record ended in, or `None` if the claim was lost.
#[instrument(skip_all, fields(message_id = %message_id))]
pub async fn mark_send_failed(
    pool: &Pool,
    message_id: &str,
    run_id: &str,
    detail: &str,
    max_attempts: i64,
) -> Result<Option<ProcessingStatus>> {
    let status: Option<String> = sqlx::query_scalar(
        "UPDATE processing_records \
         SET attempt_count = attempt_count + 1, \
             status = CASE WHEN attempt_count + 1 >= ? THEN 'failed' ELSE 'classified' END, \
             terminal = CASE WHEN attempt_count + 1 >= ? THEN 1 ELSE 0 END, \
             error_detail = ?, claimed_by = NULL, lease_expires_at = NULL, updated_at = ? \
         WHERE message_id = ? AND status = 'classified' AND claimed_by = ? \
         RETURNING status",
    )
    .bind(max_attempts)
    .bind(max_attempts)
    .bind(detail)
    .bind(Utc::now())
    .bind(message_id)
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    Ok(status.as_deref().and_then(ProcessingStatus::parse_status))
}

/// Move a claimed record to Failed. Transient failures consume an attempt and
/// stay retryable; permanent ones are terminal with the attempt count as is.
#[instrument(skip_all, fields(message_id = %message_id, transient = transient))]
pub async fn mark_failed(
    pool: &Pool,
    message_id: &str,
    run_id: &str,
    detail: &str,
    transient: bool,
) -> Result<bool> {
    let sql = format!(
        "UPDATE processing_records \
         SET status = 'failed', \
             attempt_count = attempt_count + ?, \
             terminal = ?, \
             error_detail = ?, claimed_by = NULL, lease_expires_at = NULL, updated_at = ? \
         WHERE message_id = ? AND status IN {OPEN_STATUSES} AND claimed_by = ?"
    );
    let updated = sqlx::query(&sql)
        .bind(if transient { 1_i64 } else { 0 })
        .bind(!transient)
        .bind(detail)
        .bind(Utc::now())
        .bind(message_id)
        .bind(run_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated == 1)
}

/// Pending → Skipped. Skipped is final; `intent` is kept when classification ran.
#[instrument(skip_all, fields(message_id = %message_id, detail = %detail))]
pub async fn mark_skipped(
    pool: &Pool,
    message_id: &str,
    run_id: &str,
    detail: &str,
    intent: Option<IntentLabel>,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE processing_records \
         SET status = 'skipped', error_detail = ?, intent_label = COALESCE(?, intent_label), \
             claimed_by = NULL, lease_expires_at = NULL, updated_at = ? \
         WHERE message_id = ? AND status = 'pending' AND claimed_by = ?",
    )
    .bind(detail)
    .bind(intent.map(|i| i.as_str()))
    .bind(Utc::now())
    .bind(message_id)
    .bind(run_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

/// The mailbox confirmed `mark_handled`; later runs stop asking it again.
pub async fn mark_mailbox_handled(pool: &Pool, message_id: &str) -> Result<()> {
    sqlx::query("UPDATE processing_records SET mailbox_handled = 1 WHERE message_id = ?")
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_record(pool: &Pool, message_id: &str) -> Result<Option<ProcessingRecord>> {
    let row = sqlx::query("SELECT * FROM processing_records WHERE message_id = ?")
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_by_status(
    pool: &Pool,
    status: ProcessingStatus,
    limit: i64,
) -> Result<Vec<ProcessingRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM processing_records WHERE status = ? ORDER BY updated_at DESC LIMIT ?",
    )
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

/// Unfinished records that a new claim could take over right now, oldest first.
#[instrument(skip_all)]
pub async fn retryable_records(
    pool: &Pool,
    max_attempts: i64,
    limit: i64,
) -> Result<Vec<ProcessingRecord>> {
    let sql = format!(
        "SELECT * FROM processing_records \
         WHERE status IN {OPEN_STATUSES} AND terminal = 0 AND attempt_count < ? \
           AND (lease_expires_at IS NULL OR lease_expires_at <= ?) \
         ORDER BY received_at ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(max_attempts)
        .bind(Utc::now().timestamp_millis())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

#[instrument(skip_all)]
pub async fn status_counts(pool: &Pool) -> Result<Vec<StatusCount>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM processing_records GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;
    let counts = rows
        .into_iter()
        .filter_map(|(status, count)| match ProcessingStatus::parse_status(&status) {
            Some(status) => Some(StatusCount { status, count }),
            None => {
                warn!(%status, "unknown status in processing_records");
                None
            }
        })
        .collect();
    Ok(counts)
}

fn record_from_row(row: &SqliteRow) -> Result<ProcessingRecord> {
    let message_id: String = row.get("message_id");
    let status_str: String = row.get("status");
    let status = ProcessingStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("record {} has unknown status {}", message_id, status_str))?;

    let intent_label = row
        .try_get::<Option<String>, _>("intent_label")
        .ok()
        .flatten()
        .map(|s| IntentLabel::parse_label(&s));

    let message = InboundMessage {
        message_id: message_id.clone(),
        thread_id: row.get("thread_id"),
        sender_address: row.get("sender_address"),
        subject: row.get("subject"),
        body: row.get("body"),
        received_at: row.get("received_at"),
    };

    Ok(ProcessingRecord {
        message_id,
        status,
        intent_label,
        confidence: row.try_get::<Option<f32>, _>("confidence").ok().flatten(),
        draft_response: row
            .try_get::<Option<String>, _>("draft_response")
            .ok()
            .flatten(),
        error_detail: row.try_get::<Option<String>, _>("error_detail").ok().flatten(),
        attempt_count: row.get("attempt_count"),
        terminal: row.get("terminal"),
        message,
        claimed_by: row.try_get::<Option<String>, _>("claimed_by").ok().flatten(),
        mailbox_handled: row.try_get("mailbox_handled").unwrap_or(false),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn file_urls_are_normalised_and_parent_created() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested/dir/mailbot.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested/dir").exists());
    }
}
