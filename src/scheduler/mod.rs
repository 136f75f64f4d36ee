// Batch scheduler
//
// Owns the scan loop, the dispatch loop, the worker pool and the current
// configuration snapshot. State machine:
//
//   stopped -> running -> paused -> running -> stopped
//
// Pause and stop are cooperative. Loops look at the control state between
// iterations and in-flight jobs always run to completion; a job stuck past
// its timeout is left to reclamation.

pub mod load;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use crate::clock::{CanonicalTime, Clock, SystemClock};
use crate::config::{ConfigSource, SchedulerConfig};
use crate::constants::{DISPATCH_BUSY_MS, DISPATCH_IDLE_MS, RECLAIM_INTERVAL_SECS};
use crate::db;
use crate::db::schema::FileJob;
use crate::error::{PackError, Result};
use crate::ingest::{Discoverer, DiscoveryRequest, ScanReport};
use crate::jobs::{self, progress, runner, worker::WorkerPool, JobOutcome};
use crate::metadata::{CreationTimeSource, FfprobeCreationTime};
use crate::sampler::Pipeline;

pub use load::{pool_size, LoadSampler, SystemLoadSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Scan,
    Dispatch,
}

impl LoopKind {
    fn slot(self) -> usize {
        match self {
            LoopKind::Scan => 0,
            LoopKind::Dispatch => 1,
        }
    }
}

/// Control state shared with the loops. `epoch` bumps on every transition;
/// each loop records the last epoch it observed in `seen`.
#[derive(Debug)]
struct Control {
    state: SchedulerState,
    epoch: u64,
    seen: [u64; 2],
    alive: [bool; 2],
}

struct Signals {
    control: Mutex<Control>,
    changed: Condvar,
}

impl Signals {
    fn new() -> Self {
        Self {
            control: Mutex::new(Control {
                state: SchedulerState::Stopped,
                epoch: 0,
                seen: [0; 2],
                alive: [false; 2],
            }),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> Result<SchedulerState> {
        Ok(self.control.lock()?.state)
    }

    fn launch(&self) -> Result<()> {
        let mut c = self.control.lock()?;
        c.state = SchedulerState::Running;
        c.epoch += 1;
        c.seen = [c.epoch; 2];
        c.alive = [true; 2];
        Ok(())
    }

    /// Top of a loop iteration. Blocks while paused. Returns the epoch the
    /// iteration runs under, or None when the loop must exit.
    fn begin(&self, kind: LoopKind) -> Result<Option<u64>> {
        let mut c = self.control.lock()?;
        loop {
            if c.seen[kind.slot()] != c.epoch {
                c.seen[kind.slot()] = c.epoch;
                self.changed.notify_all();
            }
            let state = c.state;
            match state {
                SchedulerState::Running => return Ok(Some(c.epoch)),
                SchedulerState::Stopped => return Ok(None),
                SchedulerState::Paused => c = self.changed.wait(c)?,
            }
        }
    }

    /// Sleep between iterations; any transition since `epoch` cuts it short.
    fn idle(&self, epoch: u64, dur: Duration) -> Result<()> {
        let c = self.control.lock()?;
        let (guard, _timeout) = self.changed.wait_timeout_while(c, dur, |c| c.epoch == epoch)?;
        drop(guard);
        Ok(())
    }

    fn exited(&self, kind: LoopKind) {
        let mut c = match self.control.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        c.alive[kind.slot()] = false;
        self.changed.notify_all();
    }

    /// Switch state and wait until every live loop has observed it.
    fn transition(&self, to: SchedulerState) -> Result<()> {
        let mut c = self.control.lock()?;
        c.state = to;
        c.epoch += 1;
        let target = c.epoch;
        self.changed.notify_all();
        let guard = self
            .changed
            .wait_while(c, |c| (0..2).any(|i| c.alive[i] && c.seen[i] < target))?;
        drop(guard);
        Ok(())
    }
}

/// Marks a loop as gone when its thread leaves, panics included, so a
/// transition never waits on it.
struct LoopExit<'a> {
    signals: &'a Signals,
    kind: LoopKind,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        self.signals.exited(self.kind);
    }
}

/// Result of one ad-hoc file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdHocResult {
    pub job_id: i64,
    pub path: String,
    /// Err when the outcome could not be recorded; the job then waits for
    /// timeout reclamation.
    pub outcome: std::result::Result<JobOutcome, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdHocReport {
    pub scan: ScanReport,
    pub results: Vec<AdHocResult>,
}

struct Inner {
    db_path: PathBuf,
    config_source: Arc<dyn ConfigSource>,
    creation: Arc<dyn CreationTimeSource>,
    pipeline: Pipeline,
    clock: Arc<dyn Clock>,
    load: Arc<dyn LoadSampler>,
    cameras: Vec<String>,
    signals: Signals,
    config: Mutex<Arc<SchedulerConfig>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    adhoc: Mutex<()>,
    /// Jobs finished by pools (or inline ad-hoc runs) that are gone.
    finished_prior: AtomicU64,
}

/// Builder for a `Scheduler`. Anything not set gets the production
/// implementation.
pub struct SchedulerBuilder {
    db_path: PathBuf,
    config_source: Arc<dyn ConfigSource>,
    creation: Option<Arc<dyn CreationTimeSource>>,
    pipeline: Option<Pipeline>,
    clock: Option<Arc<dyn Clock>>,
    load: Option<Arc<dyn LoadSampler>>,
    cameras: Vec<String>,
}

impl SchedulerBuilder {
    pub fn creation_source(mut self, source: Arc<dyn CreationTimeSource>) -> Self {
        self.creation = Some(source);
        self
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn load_sampler(mut self, load: Arc<dyn LoadSampler>) -> Self {
        self.load = Some(load);
        self
    }

    /// Limit scanning to these cameras (empty means all enabled cameras).
    pub fn cameras(mut self, ids: Vec<String>) -> Self {
        self.cameras = ids;
        self
    }

    /// Load the configuration and prepare the database. A failure here is
    /// the one fatal configuration error.
    pub fn build(self) -> Result<Scheduler> {
        let config = self.config_source.get_camera_config()?;
        db::open_db(&self.db_path)?;

        let inner = Inner {
            db_path: self.db_path,
            config_source: self.config_source,
            creation: self.creation.unwrap_or_else(|| Arc::new(FfprobeCreationTime)),
            pipeline: self.pipeline.unwrap_or_else(Pipeline::external),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            load: self.load.unwrap_or_else(|| Arc::new(SystemLoadSampler::new())),
            cameras: self.cameras,
            signals: Signals::new(),
            config: Mutex::new(Arc::new(config)),
            pool: Mutex::new(None),
            adhoc: Mutex::new(()),
            finished_prior: AtomicU64::new(0),
        };
        Ok(Scheduler {
            inner: Arc::new(inner),
            threads: Mutex::new(Vec::new()),
        })
    }
}

pub struct Scheduler {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(db_path: impl Into<PathBuf>, config_source: Arc<dyn ConfigSource>) -> SchedulerBuilder {
        SchedulerBuilder {
            db_path: db_path.into(),
            config_source,
            creation: None,
            pipeline: None,
            clock: None,
            load: None,
            cameras: Vec::new(),
        }
    }

    pub fn state(&self) -> Result<SchedulerState> {
        self.inner.signals.state()
    }

    /// Start the scan and dispatch loops. The first scan uses `request`;
    /// every later scan is continuous.
    pub fn start(&self, request: DiscoveryRequest) -> Result<()> {
        let mut threads = self.threads.lock()?;
        let state = self.state()?;
        if state != SchedulerState::Stopped {
            return Err(PackError::InvalidState(format!("cannot start while {:?}", state)));
        }
        if let DiscoveryRequest::AdHoc { .. } = request {
            return Err(PackError::InvalidState("ad-hoc requests go through run_adhoc".to_string()));
        }

        let config = self.inner.reload_config();
        let workers = config.max_batch.max(config.min_batch);
        let pool = Arc::new(WorkerPool::spawn(
            workers,
            &self.inner.db_path,
            self.inner.pipeline.clone(),
            Arc::clone(&self.inner.clock),
        )?);
        *self.inner.pool.lock()? = Some(Arc::clone(&pool));
        self.inner.signals.launch()?;

        let mode = request.mode();
        let scan_inner = Arc::clone(&self.inner);
        let scan = std::thread::Builder::new()
            .name("packcam-scan".into())
            .spawn(move || scan_loop(scan_inner, request));
        let dispatch_inner = Arc::clone(&self.inner);
        let dispatch_pool = Arc::clone(&pool);
        let dispatch = std::thread::Builder::new()
            .name("packcam-dispatch".into())
            .spawn(move || dispatch_loop(dispatch_inner, dispatch_pool));

        let mut failure = None;
        for handle in [scan, dispatch] {
            match handle {
                Ok(h) => threads.push(h),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            drop(threads);
            self.stop()?;
            return Err(e.into());
        }

        log::info!("Scheduler started ({} first, {} worker(s))", mode.as_str(), workers);
        Ok(())
    }

    /// Stop both loops and wait for in-flight jobs. Stopping a stopped
    /// scheduler does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut threads = self.threads.lock()?;
        let pool = self.inner.pool.lock()?.take();
        if self.state()? == SchedulerState::Stopped && threads.is_empty() && pool.is_none() {
            return Ok(());
        }

        self.inner.signals.transition(SchedulerState::Stopped)?;
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Scheduler loop panicked");
            }
        }
        if let Some(pool) = pool {
            pool.shutdown()?;
            self.inner.finished_prior.fetch_add(pool.finished(), Ordering::SeqCst);
        }

        log::info!("Scheduler stopped");
        Ok(())
    }

    /// Stop starting new scan and dispatch iterations. Returns once both
    /// loops have observed the pause.
    pub fn pause(&self) -> Result<()> {
        match self.state()? {
            SchedulerState::Running => {
                self.inner.signals.transition(SchedulerState::Paused)?;
                log::info!("Scheduler paused");
                Ok(())
            }
            SchedulerState::Paused => Ok(()),
            SchedulerState::Stopped => Err(PackError::InvalidState("cannot pause a stopped scheduler".to_string())),
        }
    }

    /// Let both loops continue. Returns once both have observed it.
    pub fn resume(&self) -> Result<()> {
        match self.state()? {
            SchedulerState::Paused => {
                self.inner.signals.transition(SchedulerState::Running)?;
                log::info!("Scheduler resumed");
                Ok(())
            }
            SchedulerState::Running => Ok(()),
            SchedulerState::Stopped => Err(PackError::InvalidState("cannot resume a stopped scheduler".to_string())),
        }
    }

    /// Process a file, or every video under a directory, right now.
    ///
    /// A running scheduler is paused for the duration and resumed after,
    /// so continuous scanning cannot starve the request. Queue state of
    /// other jobs is left as it was.
    pub fn run_adhoc(&self, path: &Path, camera: Option<&str>) -> Result<AdHocReport> {
        let _serial = self.inner.adhoc.lock()?;

        let paused_here = if self.state()? == SchedulerState::Running {
            self.pause()?;
            true
        } else {
            false
        };

        let report = self.inner.process_adhoc(path, camera);

        // A stop() may have happened meanwhile
        if paused_here && self.state()? == SchedulerState::Paused {
            self.resume()?;
        }
        report
    }

    pub fn get_progress(&self) -> Result<progress::Progress> {
        let conn = db::open_worker_connection(&self.inner.db_path)?;
        let snapshot = progress::read_progress(&conn)?;

        let prior = self.inner.finished_prior.load(Ordering::SeqCst);
        let pool = self.inner.pool.lock()?.clone();
        let (finished, current) = match pool {
            Some(pool) => (prior + pool.finished(), pool.current_files()),
            None => (prior, Vec::new()),
        };
        Ok(snapshot.with_run(finished, current))
    }

    pub fn list_pending_jobs(&self, limit: i64) -> Result<Vec<FileJob>> {
        let conn = db::open_worker_connection(&self.inner.db_path)?;
        jobs::list_pending_jobs(&conn, limit)
    }

    /// The configuration snapshot loops are currently using.
    pub fn config(&self) -> Arc<SchedulerConfig> {
        self.inner.current_config()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Scheduler shutdown failed: {}", e);
        }
    }
}

impl Inner {
    fn current_config(&self) -> Arc<SchedulerConfig> {
        match self.config.lock() {
            Ok(c) => Arc::clone(&c),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Fetch a fresh snapshot, keeping the last good one if that fails.
    fn reload_config(&self) -> Arc<SchedulerConfig> {
        match self.config_source.get_camera_config() {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                if let Ok(mut current) = self.config.lock() {
                    *current = Arc::clone(&fresh);
                }
                fresh
            }
            Err(e) => {
                log::warn!("Config reload failed, keeping last good snapshot: {}", e);
                self.current_config()
            }
        }
    }

    fn connection<'c>(&self, slot: &'c mut Option<Connection>) -> Result<&'c Connection> {
        if slot.is_none() {
            *slot = Some(db::open_worker_connection(&self.db_path)?);
        }
        slot.as_ref()
            .ok_or_else(|| PackError::Other("no database connection".to_string()))
    }

    fn scan_once(&self, conn: &Connection, config: &SchedulerConfig, request: &DiscoveryRequest) -> Result<ScanReport> {
        Discoverer::new(config, self.creation.as_ref(), self.clock.as_ref())
            .with_cameras(&self.cameras)
            .discover(conn, request)
    }

    /// One dispatch cycle. Returns true when the pool has work, so the
    /// loop should come back soon.
    fn dispatch_once(&self, conn: &Connection, pool: &WorkerPool, config: &Arc<SchedulerConfig>, cycle: &mut DispatchCycle) -> Result<bool> {
        let now = self.clock.now();
        let reclaim_due = cycle
            .last_reclaim
            .map_or(true, |t| now.millis() - t.millis() >= RECLAIM_INTERVAL_SECS * 1000);
        if reclaim_due {
            jobs::requeue_if_timed_out(conn, config.timeout(), config.max_retries, now)?;
            cycle.last_reclaim = Some(now);
        }

        let size = pool_size(self.load.cpu_load(), config.min_batch, config.max_batch).min(pool.size());
        if size != cycle.pool_size {
            log::debug!("Worker pool size {} -> {}", cycle.pool_size, size);
            cycle.pool_size = size;
        }

        let budget = size.saturating_sub(pool.in_flight());
        if budget == 0 {
            return Ok(true);
        }

        let claimed = jobs::claim_batch(conn, budget, now)?;
        let busy = !claimed.is_empty();
        for job in claimed {
            log::info!("Dispatching job {} ({})", job.id, job.path);
            pool.submit(job, Arc::clone(config), None)?;
        }
        Ok(busy)
    }

    fn process_adhoc(&self, path: &Path, camera: Option<&str>) -> Result<AdHocReport> {
        let config = self.reload_config();
        let conn = db::open_worker_connection(&self.db_path)?;
        let request = DiscoveryRequest::AdHoc {
            path: path.to_path_buf(),
            camera: camera.map(str::to_string),
        };
        let scan = Discoverer::new(&config, self.creation.as_ref(), self.clock.as_ref()).discover(&conn, &request)?;
        let claimed = jobs::claim_jobs(&conn, &scan.enqueued, self.clock.now())?;

        let pool = self.pool.lock()?.clone();
        let mut results = Vec::with_capacity(claimed.len());
        let mut inline = Vec::new();
        match pool {
            Some(pool) => {
                let (tx, rx) = crossbeam_channel::unbounded();
                let mut claimed = claimed.into_iter();
                for job in claimed.by_ref() {
                    let id = job.id;
                    if let Err(e) = pool.submit(job.clone(), Arc::clone(&config), Some(tx.clone())) {
                        // The pool went away under us (stop); the rest runs here
                        log::warn!("Job {} not submitted ({}); processing ad-hoc jobs inline", id, e);
                        inline.push(job);
                        break;
                    }
                }
                inline.extend(claimed);
                drop(tx);
                results.extend(rx.iter().map(|result| AdHocResult {
                    job_id: result.job_id,
                    path: result.path,
                    outcome: result.outcome,
                }));
            }
            None => inline = claimed,
        }

        for job in inline {
            let outcome = runner::process_job(&conn, &self.pipeline, &config, self.clock.as_ref(), &job);
            if let Err(e) = &outcome {
                log::error!("Job {}: {}", job.id, e);
            }
            if matches!(outcome, Ok(JobOutcome::Done { .. } | JobOutcome::Failed { .. })) {
                self.finished_prior.fetch_add(1, Ordering::SeqCst);
            }
            results.push(AdHocResult {
                job_id: job.id,
                path: job.path,
                outcome: outcome.map_err(|e| e.to_string()),
            });
        }
        results.sort_by_key(|r| r.job_id);
        Ok(AdHocReport { scan, results })
    }
}

#[derive(Debug, Default)]
struct DispatchCycle {
    last_reclaim: Option<CanonicalTime>,
    pool_size: usize,
}

fn scan_loop(inner: Arc<Inner>, first: DiscoveryRequest) {
    let _exit = LoopExit { signals: &inner.signals, kind: LoopKind::Scan };
    let mut conn = None;
    let mut pending_first = Some(first);

    loop {
        let epoch = match inner.signals.begin(LoopKind::Scan) {
            Ok(Some(epoch)) => epoch,
            Ok(None) => break,
            Err(e) => {
                log::error!("Scan loop: {}", e);
                break;
            }
        };

        let config = inner.reload_config();
        let request = pending_first.clone().unwrap_or(DiscoveryRequest::Continuous);
        let result = inner
            .connection(&mut conn)
            .and_then(|c| inner.scan_once(c, &config, &request));
        match result {
            Ok(_) => pending_first = None,
            Err(e) => {
                log::error!("Scan failed: {}", e);
                conn = None;
            }
        }

        if let Err(e) = inner.signals.idle(epoch, config.sync_interval()) {
            log::error!("Scan loop: {}", e);
            break;
        }
    }
}

fn dispatch_loop(inner: Arc<Inner>, pool: Arc<WorkerPool>) {
    let _exit = LoopExit { signals: &inner.signals, kind: LoopKind::Dispatch };
    let mut conn = None;
    let mut cycle = DispatchCycle::default();

    loop {
        let epoch = match inner.signals.begin(LoopKind::Dispatch) {
            Ok(Some(epoch)) => epoch,
            Ok(None) => break,
            Err(e) => {
                log::error!("Dispatch loop: {}", e);
                break;
            }
        };

        let config = inner.current_config();
        let result = inner
            .connection(&mut conn)
            .and_then(|c| inner.dispatch_once(c, &pool, &config, &mut cycle));
        let wait = match result {
            Ok(true) => DISPATCH_BUSY_MS,
            Ok(false) => DISPATCH_IDLE_MS,
            Err(e) => {
                log::error!("Dispatch failed: {}", e);
                conn = None;
                DISPATCH_IDLE_MS
            }
        };

        if let Err(e) = inner.signals.idle(epoch, Duration::from_millis(wait)) {
            log::error!("Dispatch loop: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests;
