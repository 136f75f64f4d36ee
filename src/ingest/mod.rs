// File discovery
//
// Walks camera roots, resolves each file's creation time through the single
// canonical normalizer, applies the mode's filters and enqueues survivors.
// A bad file is skipped; a misconfigured camera fails only its own scan.

pub mod discover;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;

use crate::clock::{CanonicalTime, Clock};
use crate::config::{CameraConfig, SchedulerConfig};
use crate::db::schema::{self, DiscoveryMode, NewFileJob};
use crate::error::{PackError, Result};
use crate::jobs;
use crate::metadata::{resolve_creation_time, CreationTimeSource};

const SECS_PER_DAY: i64 = 86_400;

/// A discovery pass and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryRequest {
    /// Files created within the last `days` days.
    BulkBackfill { days: u32 },
    /// Files newer than each camera's watermark, inside the working window.
    Continuous,
    /// Exactly this file, or every video file beneath this directory.
    AdHoc { path: PathBuf, camera: Option<String> },
}

impl DiscoveryRequest {
    pub fn mode(&self) -> DiscoveryMode {
        match self {
            DiscoveryRequest::BulkBackfill { .. } => DiscoveryMode::BulkBackfill,
            DiscoveryRequest::Continuous => DiscoveryMode::Continuous,
            DiscoveryRequest::AdHoc { .. } => DiscoveryMode::AdHoc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraScanError {
    pub camera: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Files that passed every filter.
    pub candidates: usize,
    /// Ids of rows inserted (or reset, for ad-hoc).
    pub enqueued: Vec<i64>,
    pub skipped_existing: usize,
    /// Files skipped because no creation time could be read.
    pub skipped_files: usize,
    pub outside_window: usize,
    /// Continuous scan stopped at the queue-depth cap.
    pub capped: bool,
    pub camera_errors: Vec<CameraScanError>,
}

impl ScanReport {
    fn merge(&mut self, other: ScanReport) {
        self.candidates += other.candidates;
        self.enqueued.extend(other.enqueued);
        self.skipped_existing += other.skipped_existing;
        self.skipped_files += other.skipped_files;
        self.outside_window += other.outside_window;
        self.capped |= other.capped;
        self.camera_errors.extend(other.camera_errors);
    }
}

/// One configuration snapshot plus the collaborators discovery needs.
pub struct Discoverer<'a> {
    config: &'a SchedulerConfig,
    creation: &'a dyn CreationTimeSource,
    clock: &'a dyn Clock,
    selection: Option<&'a [String]>,
}

impl<'a> Discoverer<'a> {
    pub fn new(config: &'a SchedulerConfig, creation: &'a dyn CreationTimeSource, clock: &'a dyn Clock) -> Self {
        Self {
            config,
            creation,
            clock,
            selection: None,
        }
    }

    /// Restrict bulk-backfill and continuous passes to these camera ids.
    pub fn with_cameras(mut self, ids: &'a [String]) -> Self {
        if !ids.is_empty() {
            self.selection = Some(ids);
        }
        self
    }

    /// Run one discovery pass and enqueue what it finds.
    pub fn discover(&self, conn: &Connection, request: &DiscoveryRequest) -> Result<ScanReport> {
        let now = self.clock.now();

        if let DiscoveryRequest::AdHoc { path, camera } = request {
            return self.discover_ad_hoc(conn, path, camera.as_deref(), now);
        }

        let mut report = ScanReport::default();
        let mut pending = match request {
            DiscoveryRequest::Continuous => Some(jobs::count_pending(conn)?),
            _ => None,
        };

        for camera in self.config.cameras.iter().filter(|c| self.is_selected(c)) {
            if report.capped {
                break;
            }
            match self.scan_camera(conn, camera, request, now, &mut pending) {
                Ok(camera_report) => report.merge(camera_report),
                Err(e @ PackError::Database(_)) => return Err(e),
                Err(e) => {
                    log::error!("Scan of camera '{}' failed: {}", camera.id, e);
                    report.camera_errors.push(CameraScanError {
                        camera: camera.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Discovery ({}): {} candidate(s), {} enqueued, {} already known, {} skipped{}",
            request.mode().as_str(),
            report.candidates,
            report.enqueued.len(),
            report.skipped_existing,
            report.skipped_files,
            if report.capped { ", queue cap reached" } else { "" }
        );
        Ok(report)
    }

    fn is_selected(&self, camera: &CameraConfig) -> bool {
        if !camera.enabled {
            return false;
        }
        match self.selection {
            Some(ids) => ids.iter().any(|id| id == &camera.id),
            None => true,
        }
    }

    fn scan_camera(
        &self,
        conn: &Connection,
        camera: &CameraConfig,
        request: &DiscoveryRequest,
        now: CanonicalTime,
        pending: &mut Option<i64>,
    ) -> Result<ScanReport> {
        camera.validate(self.config.scan_mode)?;
        let tz = self.config.timezone;

        let (lower_bound, in_window_only) = match request {
            DiscoveryRequest::BulkBackfill { days } => (now.minus_secs(i64::from(*days) * SECS_PER_DAY), false),
            _ => {
                let mark = schema::get_watermark(conn, &camera.id)?;
                (mark.unwrap_or_else(|| now.start_of_local_day(tz)), true)
            }
        };

        let mut report = ScanReport::default();
        let mut dated = Vec::new();
        for path in discover::discover_video_files(&camera.root)? {
            let path_str = path.to_string_lossy().to_string();
            if schema::path_is_known(conn, &path_str)? {
                report.skipped_existing += 1;
                continue;
            }
            let created = resolve_creation_time(self.creation, &path, tz);
            match created.time() {
                Some(t) => dated.push((t, path_str, created.source_label())),
                None => {
                    log::warn!("Skipping {}: {:?}", path.display(), created);
                    report.skipped_files += 1;
                }
            }
        }
        dated.sort();

        let cap = self.config.queue_depth_cap as i64;
        let mut newest_considered = None;
        for (created_at, path, source) in dated {
            if created_at < lower_bound {
                continue;
            }
            if in_window_only && !self.config.working_hours.contains(created_at, tz) {
                report.outside_window += 1;
                newest_considered = Some(created_at);
                continue;
            }
            if let Some(depth) = pending {
                if *depth >= cap {
                    report.capped = true;
                    log::info!("Queue depth cap ({}) reached while scanning camera '{}'", cap, camera.id);
                    break;
                }
            }

            report.candidates += 1;
            let job = NewFileJob {
                path,
                camera_id: camera.id.clone(),
                mode: request.mode(),
                created_at,
                created_at_source: source.to_string(),
            };
            match jobs::enqueue(conn, &job, now)? {
                Some(id) => {
                    report.enqueued.push(id);
                    if let Some(depth) = pending.as_mut() {
                        *depth += 1;
                    }
                }
                None => report.skipped_existing += 1,
            }
            newest_considered = Some(created_at);
        }

        // Only advance past files that were actually considered
        if let Some(t) = newest_considered {
            schema::raise_watermark(conn, &camera.id, t, now)?;
        }
        Ok(report)
    }

    fn discover_ad_hoc(
        &self,
        conn: &Connection,
        path: &Path,
        camera_id: Option<&str>,
        now: CanonicalTime,
    ) -> Result<ScanReport> {
        let path = absolute(path)?;
        if !path.exists() {
            return Err(PackError::FileNotFound(path.display().to_string()));
        }

        let camera = match camera_id {
            Some(id) => self
                .config
                .camera(id)
                .ok_or_else(|| PackError::Config(format!("unknown camera '{}'", id)))?,
            None => self.config.camera_for_path(&path).ok_or_else(|| {
                PackError::Config(format!(
                    "{} is not under any camera root; pass a camera id",
                    path.display()
                ))
            })?,
        };
        camera.validate(self.config.scan_mode)?;

        // An explicitly named file is taken as-is, whatever its extension
        let files = if path.is_file() {
            vec![path.clone()]
        } else {
            discover::discover_video_files(&path)?
        };

        let tz = self.config.timezone;
        let mut dated = Vec::new();
        let mut report = ScanReport::default();
        for file in files {
            let created = resolve_creation_time(self.creation, &file, tz);
            match created.time() {
                Some(t) => dated.push((t, file.to_string_lossy().to_string(), created.source_label())),
                None => {
                    log::warn!("Skipping {}: {:?}", file.display(), created);
                    report.skipped_files += 1;
                }
            }
        }
        dated.sort();

        for (created_at, path, source) in dated {
            report.candidates += 1;
            let job = NewFileJob {
                path,
                camera_id: camera.id.clone(),
                mode: DiscoveryMode::AdHoc,
                created_at,
                created_at_source: source.to_string(),
            };
            match jobs::enqueue(conn, &job, now)? {
                Some(id) => report.enqueued.push(id),
                None => {
                    log::warn!("{} is already being processed", job.path);
                    report.skipped_existing += 1;
                }
            }
        }

        log::info!(
            "Ad-hoc discovery of {}: {} file(s) enqueued for camera '{}'",
            path.display(),
            report.enqueued.len(),
            camera.id
        );
        Ok(report)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests;
