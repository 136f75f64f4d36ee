// Queue progress snapshot

use rusqlite::Connection;
use serde::Serialize;

use crate::db::schema::{self, StatusCounts};
use crate::error::Result;

/// What `get_progress` reports. Queue counts come from the store; the
/// per-run fields come from the scheduler instance that built it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    /// `done + failed`
    pub processed: i64,
    pub percent: f64,
    /// Jobs finished by this scheduler since it was created.
    pub processed_this_run: u64,
    pub current_file: Option<String>,
    pub in_flight: Vec<String>,
}

impl Progress {
    pub fn from_counts(counts: StatusCounts) -> Self {
        let total = counts.total();
        let processed = counts.done + counts.failed;
        let percent = (processed as f64 / total.max(1) as f64) * 100.0;
        Self {
            total,
            pending: counts.pending,
            processing: counts.processing,
            done: counts.done,
            failed: counts.failed,
            processed,
            percent: percent.min(100.0),
            ..Default::default()
        }
    }

    pub fn with_run(mut self, processed_this_run: u64, mut in_flight: Vec<String>) -> Self {
        in_flight.sort();
        self.processed_this_run = processed_this_run;
        self.current_file = in_flight.first().cloned();
        self.in_flight = in_flight;
        self
    }
}

/// Queue-wide counts, without any scheduler-instance fields.
pub fn read_progress(conn: &Connection) -> Result<Progress> {
    Ok(Progress::from_counts(schema::count_by_status(conn)?))
}
