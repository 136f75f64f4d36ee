// Worker pool -- a bounded set of threads running claimed jobs.
//
// Jobs arrive already claimed. Each worker owns its own database connection
// and only touches the queue to record the outcome of the job it holds, so
// no lock is held across sampling or detector calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use rusqlite::Connection;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db;
use crate::db::schema::FileJob;
use crate::error::{PackError, Result};
use crate::sampler::Pipeline;

use super::runner::{self, JobOutcome};

/// Outcome of one task, sent back to whoever asked for it.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub job_id: i64,
    pub path: String,
    /// Err when the outcome could not be recorded; the job is then left to
    /// timeout reclamation.
    pub outcome: std::result::Result<JobOutcome, String>,
}

struct Task {
    job: FileJob,
    config: Arc<SchedulerConfig>,
    reply: Option<Sender<TaskResult>>,
}

#[derive(Default)]
struct PoolShared {
    in_flight: AtomicUsize,
    finished: AtomicU64,
    current: Mutex<BTreeMap<i64, String>>,
}

pub struct WorkerPool {
    size: usize,
    sender: Mutex<Option<Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Start `size` worker threads (at least one).
    pub fn spawn(size: usize, db_path: &Path, pipeline: Pipeline, clock: Arc<dyn Clock>) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let shared = Arc::new(PoolShared::default());

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let db_path = db_path.to_path_buf();
            let pipeline = pipeline.clone();
            let clock = Arc::clone(&clock);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("packcam-worker-{}", i))
                .spawn(move || worker_loop(rx, db_path, pipeline, clock, shared))?;
            handles.push(handle);
        }
        log::debug!("Started {} worker(s)", size);

        Ok(Self {
            size,
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            shared,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs that reached `done` or `failed` through this pool.
    pub fn finished(&self) -> u64 {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Paths of the jobs currently held by workers.
    pub fn current_files(&self) -> Vec<String> {
        match self.shared.current.lock() {
            Ok(current) => current.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Hand a claimed job to the pool. `reply` receives its result.
    pub fn submit(&self, job: FileJob, config: Arc<SchedulerConfig>, reply: Option<Sender<TaskResult>>) -> Result<()> {
        let guard = self.sender.lock()?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| PackError::InvalidState("worker pool is shut down".to_string()))?;

        let (id, path) = (job.id, job.path.clone());
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        self.shared.current.lock()?.insert(id, path);

        if sender.send(Task { job, config, reply }).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.shared.current.lock()?.remove(&id);
            return Err(PackError::InvalidState("worker pool has no workers".to_string()));
        }
        Ok(())
    }

    /// Stop accepting jobs and wait for the workers to finish what they hold.
    /// Calling it twice is harmless.
    pub fn shutdown(&self) -> Result<()> {
        self.sender.lock()?.take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock()?);
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Worker thread panicked during shutdown");
            }
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Worker pool shutdown failed: {}", e);
        }
    }
}

fn worker_loop(
    rx: Receiver<Task>,
    db_path: PathBuf,
    pipeline: Pipeline,
    clock: Arc<dyn Clock>,
    shared: Arc<PoolShared>,
) {
    let mut conn: Option<Connection> = None;

    for task in rx.iter() {
        let outcome = run_task(&mut conn, &db_path, &pipeline, clock.as_ref(), &task);

        match &outcome {
            Ok(JobOutcome::Done { .. }) | Ok(JobOutcome::Failed { .. }) => {
                shared.finished.fetch_add(1, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("Job {}: {}", task.job.id, e);
                // The connection may be broken; open a fresh one next time
                conn = None;
            }
        }
        if let Ok(mut current) = shared.current.lock() {
            current.remove(&task.job.id);
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(reply) = task.reply {
            let _ = reply.send(TaskResult {
                job_id: task.job.id,
                path: task.job.path,
                outcome,
            });
        }
    }
}

fn run_task(
    conn: &mut Option<Connection>,
    db_path: &Path,
    pipeline: &Pipeline,
    clock: &dyn Clock,
    task: &Task,
) -> std::result::Result<JobOutcome, String> {
    if conn.is_none() {
        *conn = Some(db::open_worker_connection(db_path).map_err(|e| format!("failed to open DB: {}", e))?);
    }
    let conn = conn.as_ref().ok_or_else(|| "no database connection".to_string())?;

    // Catch panics so one bad file never takes a worker down
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        runner::process_job(conn, pipeline, &task.config, clock, &task.job)
    }));
    match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("job panicked (recovered)".to_string()),
    }
}
