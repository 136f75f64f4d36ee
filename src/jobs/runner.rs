// Job runner - takes one claimed file from sampling to stored events

use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::correlate::{correlate, CorrelatorSettings, FileContext, PackingEvent};
use crate::db::schema::{self, FileJob, JobStatus};
use crate::error::{PackError, Result};
use crate::jobs::{claim_batch, mark_done, mark_failed, release_for_retry};
use crate::sampler::{self, DetectionRecord, Pipeline};

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Done { events: usize },
    /// Permanent failure, or a transient one past `max_retries`.
    Failed { error: String },
    /// Transient failure; the job is pending again.
    Retrying { error: String },
    /// The claim was reclaimed while this worker ran; its results were dropped.
    Stale,
}

/// Process one claimed job and record the outcome in the queue.
///
/// Per-file failures are written to the job row and returned as an outcome.
/// Only a failure to update the queue itself is returned as an error; the
/// job then stays `processing` until timeout reclamation picks it up.
pub fn process_job(
    conn: &Connection,
    pipeline: &Pipeline,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    job: &FileJob,
) -> Result<JobOutcome> {
    log::debug!("Processing job {} ({})", job.id, job.path);

    let analysed = analyse(pipeline, config, job);
    let now = clock.now();

    match analysed {
        Ok((records, events)) => {
            if !mark_done(conn, job, &events, now)? {
                log::warn!("Job {} was reclaimed while running; discarding its results", job.id);
                return Ok(JobOutcome::Stale);
            }
            if config.retain_detections {
                let tx = conn.unchecked_transaction()?;
                schema::clear_detections(&tx, job.id)?;
                schema::insert_detections(&tx, job.id, &records)?;
                tx.commit()?;
            }
            Ok(JobOutcome::Done { events: events.len() })
        }
        Err(e) if e.is_transient() => {
            let error = e.to_string();
            match release_for_retry(conn, job, &error, config.max_retries, now)? {
                Some(JobStatus::Failed) => {
                    log::error!("Job {} failed after {} retries: {}", job.id, job.retries + 1, error);
                    Ok(JobOutcome::Failed { error })
                }
                Some(_) => {
                    log::warn!("Job {} will be retried: {}", job.id, error);
                    Ok(JobOutcome::Retrying { error })
                }
                None => Ok(JobOutcome::Stale),
            }
        }
        Err(e) => {
            let error = e.to_string();
            if mark_failed(conn, job, &error, now)? {
                log::error!("Job {} failed: {}", job.id, error);
                Ok(JobOutcome::Failed { error })
            } else {
                Ok(JobOutcome::Stale)
            }
        }
    }
}

fn analyse(
    pipeline: &Pipeline,
    config: &SchedulerConfig,
    job: &FileJob,
) -> Result<(Vec<DetectionRecord>, Vec<PackingEvent>)> {
    let camera = config.camera(&job.camera_id).ok_or_else(|| PackError::CameraConfig {
        camera: job.camera_id.clone(),
        reason: "camera is no longer configured".to_string(),
    })?;
    let zones = camera.zones(config.scan_mode)?;
    let settings = CorrelatorSettings::from_config(config)?;

    let path = Path::new(&job.path);
    if !path.is_file() {
        return Err(PackError::FileNotFound(job.path.clone()));
    }

    let records = sampler::sample(pipeline, path, &zones, config.frame_interval_ms, config.scan_mode)?;

    let ctx = FileContext {
        camera_id: job.camera_id.clone(),
        source_path: job.path.clone(),
        file_start: job.created_at,
    };
    let events = correlate(&records, &settings, &ctx);
    Ok((records, events))
}

/// Claim and run the next pending job on this thread. Returns None when the
/// queue is empty.
pub fn run_next_job(
    conn: &Connection,
    pipeline: &Pipeline,
    config: &SchedulerConfig,
    clock: &dyn Clock,
) -> Result<Option<(FileJob, JobOutcome)>> {
    let job = match claim_batch(conn, 1, clock.now())?.pop() {
        Some(j) => j,
        None => return Ok(None),
    };
    let outcome = process_job(conn, pipeline, config, clock, &job)?;
    Ok(Some((job, outcome)))
}

/// Run pending jobs until the queue is empty
pub fn run_all_jobs(
    conn: &Connection,
    pipeline: &Pipeline,
    config: &SchedulerConfig,
    clock: &dyn Clock,
) -> Result<usize> {
    let mut count = 0;
    while run_next_job(conn, pipeline, config, clock)?.is_some() {
        count += 1;
    }
    Ok(count)
}
