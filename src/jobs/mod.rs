// Job queue
//
// The file_jobs table is the only state shared between discovery, the
// dispatch loop and the workers. Every state change here is a single
// guarded UPDATE (or one transaction), so concurrent callers on separate
// connections cannot claim or complete the same job twice.

pub mod runner;
pub mod progress;
pub mod worker;

pub use runner::JobOutcome;

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::clock::CanonicalTime;
use crate::correlate::PackingEvent;
use crate::db::schema::{self, DiscoveryMode, FileJob, JobStatus, NewFileJob, FILE_JOB_COLUMNS};
use crate::error::{PackError, Result};

/// Result of one `requeue_if_timed_out` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Insert a discovered file.
///
/// Bulk-backfill and continuous candidates are skipped when any row already
/// exists for the path, whatever its mode. Ad-hoc candidates are handled by
/// `enqueue_ad_hoc`.
///
/// Returns the job id when a row was inserted, reset or raised.
pub fn enqueue(conn: &Connection, job: &NewFileJob, now: CanonicalTime) -> Result<Option<i64>> {
    let priority = job.mode.priority();

    if job.mode == DiscoveryMode::AdHoc {
        return enqueue_ad_hoc(conn, job, now);
    }

    let inserted = conn.execute(
        "INSERT INTO file_jobs
            (path, camera_id, mode, status, priority, created_at_ms, created_at_source, discovered_at_ms)
         SELECT ?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7
         WHERE NOT EXISTS (SELECT 1 FROM file_jobs WHERE path = ?1)",
        params![
            job.path,
            job.camera_id,
            job.mode,
            priority,
            job.created_at,
            job.created_at_source,
            now,
        ],
    )?;

    if inserted == 0 {
        Ok(None)
    } else {
        Ok(Some(conn.last_insert_rowid()))
    }
}

/// Queue a file for immediate processing.
///
/// At most one row per path is ever pending or processing:
/// - a path that is being processed is left alone (None);
/// - a pending row for the path, whatever its mode, is raised to ad-hoc
///   priority and its id reused;
/// - otherwise the `(path, ad-hoc)` row is inserted, or reset to pending if
///   an earlier ad-hoc run left it done or failed.
fn enqueue_ad_hoc(conn: &Connection, job: &NewFileJob, now: CanonicalTime) -> Result<Option<i64>> {
    let priority = DiscoveryMode::AdHoc.priority();
    let tx = conn.unchecked_transaction()?;

    let busy: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM file_jobs WHERE path = ?1 AND status = 'processing')",
        params![job.path],
        |row| row.get(0),
    )?;
    if busy {
        tx.commit()?;
        return Ok(None);
    }

    let waiting: Option<i64> = tx
        .query_row(
            "SELECT id FROM file_jobs WHERE path = ?1 AND status = 'pending'
             ORDER BY priority DESC, id ASC LIMIT 1",
            params![job.path],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = waiting {
        tx.execute(
            "UPDATE file_jobs SET priority = MAX(priority, ?1) WHERE id = ?2",
            params![priority, id],
        )?;
        tx.commit()?;
        log::debug!("Raised pending job {} ({}) to ad-hoc priority", id, job.path);
        return Ok(Some(id));
    }

    let id = tx
        .query_row(
            "INSERT INTO file_jobs
                (path, camera_id, mode, status, priority, created_at_ms, created_at_source, discovered_at_ms)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7)
             ON CONFLICT(path, mode) DO UPDATE SET
                status = 'pending',
                priority = excluded.priority,
                camera_id = excluded.camera_id,
                discovered_at_ms = excluded.discovered_at_ms,
                retries = 0,
                run_token = NULL,
                claimed_by = NULL,
                assigned_at_ms = NULL,
                completed_at_ms = NULL,
                last_error = NULL,
                event_count = NULL
             WHERE file_jobs.status != 'processing'
             RETURNING id",
            params![
                job.path,
                job.camera_id,
                DiscoveryMode::AdHoc,
                priority,
                job.created_at,
                job.created_at_source,
                now,
            ],
            |row| row.get(0),
        )
        .optional()?;
    tx.commit()?;
    Ok(id)
}

/// Atomically claim up to `n` pending jobs, highest priority first, then
/// oldest discovery first. Selection and the flip to `processing` are one
/// statement; each claimed job gets its own run token. A path is never
/// claimed twice: jobs whose path is already processing are skipped, and a
/// batch takes at most one row per path.
pub fn claim_batch(conn: &Connection, n: usize, now: CanonicalTime) -> Result<Vec<FileJob>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let batch_token = Uuid::new_v4().to_string();
    let worker_id = get_worker_id();
    let sql = format!(
        "UPDATE file_jobs
         SET status = 'processing',
             assigned_at_ms = ?1,
             run_token = ?2 || ':' || id,
             claimed_by = ?3
         WHERE id IN (
             SELECT id FROM (
                 SELECT id, priority, discovered_at_ms,
                        ROW_NUMBER() OVER (
                            PARTITION BY path
                            ORDER BY priority DESC, discovered_at_ms ASC, id ASC
                        ) AS nth
                 FROM file_jobs AS f
                 WHERE status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM file_jobs AS busy
                       WHERE busy.path = f.path AND busy.status = 'processing'
                   )
             )
             WHERE nth = 1
             ORDER BY priority DESC, discovered_at_ms ASC, id ASC
             LIMIT ?4
         )
         RETURNING {}",
        FILE_JOB_COLUMNS
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now, batch_token, worker_id, n as i64], schema::map_file_job)?;
    let mut jobs = rows.collect::<std::result::Result<Vec<_>, _>>()?;

    // RETURNING order is unspecified
    sort_claim_order(&mut jobs);

    if !jobs.is_empty() {
        log::debug!("Claimed {} job(s) as {}", jobs.len(), worker_id);
    }
    Ok(jobs)
}

/// Claim specific pending jobs by id (used for ad-hoc runs). Ids that are
/// not pending, or whose path is already processing, are skipped.
pub fn claim_jobs(conn: &Connection, ids: &[i64], now: CanonicalTime) -> Result<Vec<FileJob>> {
    let worker_id = get_worker_id();
    let sql = format!(
        "UPDATE file_jobs
         SET status = 'processing', assigned_at_ms = ?1, run_token = ?2, claimed_by = ?3
         WHERE id = ?4 AND status = 'pending'
           AND NOT EXISTS (
               SELECT 1 FROM file_jobs AS busy
               WHERE busy.path = file_jobs.path AND busy.status = 'processing'
           )
         RETURNING {}",
        FILE_JOB_COLUMNS
    );

    let tx = conn.unchecked_transaction()?;
    let mut jobs = Vec::with_capacity(ids.len());
    {
        let mut stmt = tx.prepare(&sql)?;
        for id in ids {
            let run_token = Uuid::new_v4().to_string();
            if let Some(job) = stmt
                .query_row(params![now, run_token, worker_id, id], schema::map_file_job)
                .optional()?
            {
                jobs.push(job);
            }
        }
    }
    tx.commit()?;

    sort_claim_order(&mut jobs);
    Ok(jobs)
}

/// Complete a claimed job and persist its events in one transaction.
///
/// Returns false (and writes nothing) when the claim is stale: the job was
/// reclaimed or re-dispatched since this worker claimed it.
pub fn mark_done(conn: &Connection, job: &FileJob, events: &[PackingEvent], now: CanonicalTime) -> Result<bool> {
    let run_token = claim_token(job)?;

    let tx = conn.unchecked_transaction()?;
    let rows = tx.execute(
        "UPDATE file_jobs
         SET status = 'done', completed_at_ms = ?1, event_count = ?2, last_error = NULL
         WHERE id = ?3 AND run_token = ?4 AND status = 'processing'",
        params![now, events.len() as i64, job.id, run_token],
    )?;
    if rows == 0 {
        // Dropping the transaction rolls it back
        return Ok(false);
    }

    let mut stored = 0;
    for event in events {
        if schema::insert_event(&tx, job.id, event, now)?.is_some() {
            stored += 1;
        }
    }
    tx.commit()?;

    log::info!(
        "Job {} done: {} event(s), {} new",
        job.id,
        events.len(),
        stored
    );
    Ok(true)
}

/// Mark a claimed job permanently failed. Returns false if the claim is stale.
pub fn mark_failed(conn: &Connection, job: &FileJob, error: &str, now: CanonicalTime) -> Result<bool> {
    let run_token = claim_token(job)?;
    let rows = conn.execute(
        "UPDATE file_jobs
         SET status = 'failed', last_error = ?1, completed_at_ms = ?2
         WHERE id = ?3 AND run_token = ?4 AND status = 'processing'",
        params![error, now, job.id, run_token],
    )?;
    Ok(rows > 0)
}

/// Give a claimed job back after a transient error. It returns to `pending`
/// with one more retry, or goes to `failed` once retries exceed `max_retries`.
///
/// Returns the new status, or None if the claim is stale.
pub fn release_for_retry(
    conn: &Connection,
    job: &FileJob,
    error: &str,
    max_retries: i32,
    now: CanonicalTime,
) -> Result<Option<JobStatus>> {
    let run_token = claim_token(job)?;
    let status = conn
        .query_row(
            "UPDATE file_jobs
             SET status = CASE WHEN retries + 1 > ?1 THEN 'failed' ELSE 'pending' END,
                 completed_at_ms = CASE WHEN retries + 1 > ?1 THEN ?2 ELSE NULL END,
                 retries = retries + 1,
                 last_error = ?3,
                 run_token = NULL,
                 claimed_by = NULL,
                 assigned_at_ms = NULL
             WHERE id = ?4 AND run_token = ?5 AND status = 'processing'
             RETURNING status",
            params![max_retries, now, error, job.id, run_token],
            |row| row.get::<_, JobStatus>(0),
        )
        .optional()?;
    Ok(status)
}

/// Reclaim jobs stuck in `processing`: those with `assigned_at + timeout <= now`
/// go back to `pending` with one more retry, or to `failed` once retries
/// would exceed `max_retries`.
pub fn requeue_if_timed_out(
    conn: &Connection,
    timeout: Duration,
    max_retries: i32,
    now: CanonicalTime,
) -> Result<ReclaimReport> {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now.plus_millis(-timeout_ms);
    let reason = format!("timed out after {}s", timeout.as_secs());

    let tx = conn.unchecked_transaction()?;
    let failed = tx.execute(
        "UPDATE file_jobs
         SET status = 'failed', retries = retries + 1, last_error = ?1, completed_at_ms = ?2,
             run_token = NULL, claimed_by = NULL
         WHERE status = 'processing' AND assigned_at_ms <= ?3 AND retries + 1 > ?4",
        params![reason, now, cutoff, max_retries],
    )?;
    let requeued = tx.execute(
        "UPDATE file_jobs
         SET status = 'pending', retries = retries + 1, last_error = ?1,
             run_token = NULL, claimed_by = NULL, assigned_at_ms = NULL
         WHERE status = 'processing' AND assigned_at_ms <= ?2 AND retries + 1 <= ?3",
        params![reason, cutoff, max_retries],
    )?;
    tx.commit()?;

    let report = ReclaimReport { requeued, failed };
    if requeued > 0 || failed > 0 {
        log::info!("Reclaimed timed-out jobs: {} requeued, {} failed", requeued, failed);
    }
    Ok(report)
}

/// Pending jobs in claim order.
pub fn list_pending_jobs(conn: &Connection, limit: i64) -> Result<Vec<FileJob>> {
    schema::list_file_jobs(conn, Some(JobStatus::Pending), limit)
}

pub fn count_pending(conn: &Connection) -> Result<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM file_jobs WHERE status = 'pending'", [], |row| row.get(0))?;
    Ok(n)
}

fn claim_token(job: &FileJob) -> Result<&str> {
    job.run_token
        .as_deref()
        .ok_or_else(|| PackError::InvalidState(format!("job {} has no run token", job.id)))
}

fn sort_claim_order(jobs: &mut [FileJob]) {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.discovered_at.cmp(&b.discovered_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Get worker identifier
fn get_worker_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    format!("{}:{}", hostname, pid)
}
