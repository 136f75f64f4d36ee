// Database schema types and query helpers

use std::collections::BTreeSet;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::CanonicalTime;
use crate::constants::{PRIORITY_AD_HOC, PRIORITY_BULK_BACKFILL, PRIORITY_CONTINUOUS};
use crate::correlate::PackingEvent;
use crate::error::Result;
use crate::sampler::{DetectionRecord, Observation, ZoneKind};

impl ToSql for CanonicalTime {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.millis()))
    }
}

impl FromSql for CanonicalTime {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(CanonicalTime::from_millis)
    }
}

// ----- Job status / discovery mode -----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    BulkBackfill,
    Continuous,
    AdHoc,
}

impl DiscoveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryMode::BulkBackfill => "bulk-backfill",
            DiscoveryMode::Continuous => "continuous",
            DiscoveryMode::AdHoc => "ad-hoc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bulk-backfill" => Some(DiscoveryMode::BulkBackfill),
            "continuous" => Some(DiscoveryMode::Continuous),
            "ad-hoc" => Some(DiscoveryMode::AdHoc),
            _ => None,
        }
    }

    /// Claim priority; ad-hoc outranks continuous, which outranks backfill.
    pub fn priority(self) -> i32 {
        match self {
            DiscoveryMode::AdHoc => PRIORITY_AD_HOC,
            DiscoveryMode::Continuous => PRIORITY_CONTINUOUS,
            DiscoveryMode::BulkBackfill => PRIORITY_BULK_BACKFILL,
        }
    }
}

macro_rules! text_enum_sql {
    ($t:ty) => {
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                <$t>::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown value '{}'", s).into()))
            }
        }
    };
}

text_enum_sql!(JobStatus);
text_enum_sql!(DiscoveryMode);

// ----- File jobs -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileJob {
    pub id: i64,
    pub path: String,
    pub camera_id: String,
    pub mode: DiscoveryMode,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: CanonicalTime,
    pub created_at_source: String,
    pub discovered_at: CanonicalTime,
    pub assigned_at: Option<CanonicalTime>,
    pub completed_at: Option<CanonicalTime>,
    pub retries: i32,
    pub run_token: Option<String>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub event_count: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewFileJob {
    pub path: String,
    pub camera_id: String,
    pub mode: DiscoveryMode,
    pub created_at: CanonicalTime,
    pub created_at_source: String,
}

pub const FILE_JOB_COLUMNS: &str = "id, path, camera_id, mode, status, priority, created_at_ms, \
     created_at_source, discovered_at_ms, assigned_at_ms, completed_at_ms, retries, run_token, \
     claimed_by, last_error, event_count";

pub fn map_file_job(row: &rusqlite::Row) -> rusqlite::Result<FileJob> {
    Ok(FileJob {
        id: row.get(0)?,
        path: row.get(1)?,
        camera_id: row.get(2)?,
        mode: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
        created_at_source: row.get(7)?,
        discovered_at: row.get(8)?,
        assigned_at: row.get(9)?,
        completed_at: row.get(10)?,
        retries: row.get(11)?,
        run_token: row.get(12)?,
        claimed_by: row.get(13)?,
        last_error: row.get(14)?,
        event_count: row.get(15)?,
    })
}

pub fn get_file_job(conn: &Connection, id: i64) -> Result<Option<FileJob>> {
    let sql = format!("SELECT {} FROM file_jobs WHERE id = ?1", FILE_JOB_COLUMNS);
    let job = conn.query_row(&sql, params![id], map_file_job).optional()?;
    Ok(job)
}

pub fn find_file_job(conn: &Connection, path: &str, mode: DiscoveryMode) -> Result<Option<FileJob>> {
    let sql = format!("SELECT {} FROM file_jobs WHERE path = ?1 AND mode = ?2", FILE_JOB_COLUMNS);
    let job = conn.query_row(&sql, params![path, mode], map_file_job).optional()?;
    Ok(job)
}

/// Jobs in claim order (priority desc, discovery time asc).
pub fn list_file_jobs(conn: &Connection, status: Option<JobStatus>, limit: i64) -> Result<Vec<FileJob>> {
    let jobs = match status {
        Some(st) => {
            let sql = format!(
                "SELECT {} FROM file_jobs WHERE status = ?1
                 ORDER BY priority DESC, discovered_at_ms ASC, id ASC LIMIT ?2",
                FILE_JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![st, limit], map_file_job)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM file_jobs ORDER BY priority DESC, discovered_at_ms ASC, id ASC LIMIT ?1",
                FILE_JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], map_file_job)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        }
    };
    Ok(jobs)
}

/// True if any job row (any mode) exists for `path`.
pub fn path_is_known(conn: &Connection, path: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM file_jobs WHERE path = ?1 LIMIT 1", params![path], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.done + self.failed
    }
}

pub fn count_by_status(conn: &Connection) -> Result<StatusCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM file_jobs GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts = StatusCounts::default();
    for row in rows {
        let (status, n) = row?;
        match status {
            JobStatus::Pending => counts.pending = n,
            JobStatus::Processing => counts.processing = n,
            JobStatus::Done => counts.done = n,
            JobStatus::Failed => counts.failed = n,
        }
    }
    Ok(counts)
}

// ----- Camera watermarks -----

pub fn get_watermark(conn: &Connection, camera_id: &str) -> Result<Option<CanonicalTime>> {
    let mark = conn
        .query_row(
            "SELECT last_seen_ms FROM camera_watermarks WHERE camera_id = ?1",
            params![camera_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(mark)
}

/// Raise the camera's watermark to `seen`; never lowers it.
pub fn raise_watermark(conn: &Connection, camera_id: &str, seen: CanonicalTime, now: CanonicalTime) -> Result<()> {
    conn.execute(
        "INSERT INTO camera_watermarks (camera_id, last_seen_ms, updated_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(camera_id) DO UPDATE SET
            last_seen_ms = MAX(last_seen_ms, excluded.last_seen_ms),
            updated_at_ms = excluded.updated_at_ms",
        params![camera_id, seen, now],
    )?;
    Ok(())
}

// ----- Packing events -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: i64,
    pub file_job_id: i64,
    pub camera_id: String,
    pub source_path: String,
    pub start: CanonicalTime,
    pub end: CanonicalTime,
    pub duration_ms: i64,
    pub tracking_codes: BTreeSet<String>,
}

/// Insert one event and its codes. Returns None if an identical event
/// (same file and span) was already stored by an earlier run.
pub fn insert_event(conn: &Connection, file_job_id: i64, event: &PackingEvent, now: CanonicalTime) -> Result<Option<i64>> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO packing_events
            (file_job_id, camera_id, source_path, start_ms, end_ms, duration_ms, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            file_job_id,
            event.camera_id,
            event.source_path,
            event.start,
            event.end,
            event.duration_ms,
            now,
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }

    let event_id = conn.last_insert_rowid();
    let mut stmt = conn.prepare_cached("INSERT OR IGNORE INTO event_codes (event_id, code) VALUES (?1, ?2)")?;
    for code in &event.tracking_codes {
        stmt.execute(params![event_id, code])?;
    }
    Ok(Some(event_id))
}

/// Dispute lookup filter. Every field is optional; bounds are canonical time.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub camera_id: Option<String>,
    pub from: Option<CanonicalTime>,
    pub to: Option<CanonicalTime>,
    pub tracking_code: Option<String>,
    pub limit: Option<i64>,
}

pub fn find_events(conn: &Connection, query: &EventQuery) -> Result<Vec<StoredEvent>> {
    let mut sql = String::from(
        "SELECT e.id, e.file_job_id, e.camera_id, e.source_path, e.start_ms, e.end_ms, e.duration_ms
         FROM packing_events e WHERE 1 = 1",
    );
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(ref camera) = query.camera_id {
        args.push(Box::new(camera.clone()));
        sql.push_str(&format!(" AND e.camera_id = ?{}", args.len()));
    }
    if let Some(from) = query.from {
        args.push(Box::new(from));
        sql.push_str(&format!(" AND e.end_ms >= ?{}", args.len()));
    }
    if let Some(to) = query.to {
        args.push(Box::new(to));
        sql.push_str(&format!(" AND e.start_ms <= ?{}", args.len()));
    }
    if let Some(ref code) = query.tracking_code {
        args.push(Box::new(code.clone()));
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM event_codes c WHERE c.event_id = e.id AND c.code = ?{})",
            args.len()
        ));
    }
    sql.push_str(" ORDER BY e.start_ms ASC, e.id ASC");
    if let Some(limit) = query.limit {
        args.push(Box::new(limit));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
        Ok(StoredEvent {
            id: row.get(0)?,
            file_job_id: row.get(1)?,
            camera_id: row.get(2)?,
            source_path: row.get(3)?,
            start: row.get(4)?,
            end: row.get(5)?,
            duration_ms: row.get(6)?,
            tracking_codes: BTreeSet::new(),
        })
    })?;
    let mut events = rows.collect::<std::result::Result<Vec<_>, _>>()?;

    for event in &mut events {
        event.tracking_codes = get_event_codes(conn, event.id)?;
    }
    Ok(events)
}

pub fn get_event_codes(conn: &Connection, event_id: i64) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached("SELECT code FROM event_codes WHERE event_id = ?1")?;
    let codes = stmt
        .query_map(params![event_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(codes)
}

pub fn count_events_for_job(conn: &Connection, file_job_id: i64) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM packing_events WHERE file_job_id = ?1",
        params![file_job_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

// ----- Detections -----

pub fn insert_detections(conn: &Connection, file_job_id: i64, records: &[DetectionRecord]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO detections (file_job_id, frame_ms, zone, hand_present, codes, confidence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for record in records {
        let (hand, codes) = match &record.observation {
            Observation::Hand(present) => (Some(*present), None),
            Observation::Codes(codes) => (None, Some(serde_json::to_string(codes)?)),
        };
        let zone = match record.zone {
            ZoneKind::Packing => "packing",
            ZoneKind::Trigger => "trigger",
        };
        stmt.execute(params![file_job_id, record.frame_ms, zone, hand, codes, record.confidence])?;
    }
    Ok(records.len())
}

/// Drop detections kept from an earlier run of the same job.
pub fn clear_detections(conn: &Connection, file_job_id: i64) -> Result<usize> {
    let n = conn.execute("DELETE FROM detections WHERE file_job_id = ?1", params![file_job_id])?;
    Ok(n)
}

pub fn count_detections_for_job(conn: &Connection, file_job_id: i64) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM detections WHERE file_job_id = ?1",
        params![file_job_id],
        |row| row.get(0),
    )?;
    Ok(n)
}
