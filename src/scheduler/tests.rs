// Scheduler scenarios: lifecycle, pause semantics, ad-hoc preemption

use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Instant;

use tempfile::TempDir;

use crate::clock::{parse_source_time, parse_user_time, ManualClock, SourceTime};
use crate::config::{CameraConfig, StaticConfig, Zone};
use crate::constants::PRIORITY_AD_HOC;
use crate::db::schema::{self, DiscoveryMode, JobStatus};
use crate::sampler::{frame_offset_ms, Frame, FrameSource, HandDetector, HandReading, QrDecoder};

const CAMERA: &str = "dock-1";

/// Every file claims metadata time 10:00 UTC on the test day. While an
/// ad-hoc file is being sampled, any lookup for a file under the camera
/// root means the scan loop was not paused.
struct Stamped {
    camera_root: PathBuf,
    adhoc_running: Arc<AtomicBool>,
    violations: AtomicUsize,
}

impl CreationTimeSource for Stamped {
    fn get_video_creation_time(&self, path: &Path) -> Result<Option<SourceTime>> {
        if self.adhoc_running.load(Ordering::SeqCst) && path.starts_with(&self.camera_root) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(parse_source_time("2024-03-10T10:00:00Z"))
    }
}

/// A minute of frames per file. Sampling an `adhoc*` file drops a new file
/// into the camera folder and takes longer than one scan interval.
struct Frames {
    late_file: PathBuf,
    adhoc_running: Arc<AtomicBool>,
}

impl FrameSource for Frames {
    fn extract(&self, video: &Path, interval_ms: u64, scratch: &Path) -> Result<Vec<Frame>> {
        let is_adhoc = video
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("adhoc"))
            .unwrap_or(false);
        if is_adhoc {
            self.adhoc_running.store(true, Ordering::SeqCst);
            std::fs::write(&self.late_file, b"late arrival")?;
            std::thread::sleep(Duration::from_millis(1_500));
            self.adhoc_running.store(false, Ordering::SeqCst);
        }
        Ok((0..=60u64)
            .map(|i| Frame {
                index: i,
                offset_ms: frame_offset_ms(i, interval_ms),
                path: scratch.join(format!("frame_{:06}.jpg", i + 1)),
            })
            .collect())
    }
}

struct Packer;

impl HandDetector for Packer {
    fn detect_hand_presence(&self, frame: &Frame, _zone: &Zone) -> Result<HandReading> {
        Ok(HandReading {
            present: (10_000..=35_000).contains(&frame.offset_ms),
            confidence: None,
        })
    }
}

struct NoCodes;

impl QrDecoder for NoCodes {
    fn decode_qr(&self, _frame: &Frame, _zone: &Zone) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct FixedLoad(Option<f32>);

impl LoadSampler for FixedLoad {
    fn cpu_load(&self) -> Option<f32> {
        self.0
    }
}

/// Good on the first call, broken afterwards.
struct FlakyConfig {
    config: SchedulerConfig,
    calls: AtomicUsize,
}

impl ConfigSource for FlakyConfig {
    fn get_camera_config(&self) -> Result<SchedulerConfig> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(self.config.clone())
        } else {
            Err(PackError::Config("config file is being rewritten".to_string()))
        }
    }
}

struct Site {
    tmp: TempDir,
    camera_root: PathBuf,
    creation: Arc<Stamped>,
    adhoc_running: Arc<AtomicBool>,
}

impl Site {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let camera_root = tmp.path().join("cam1");
        std::fs::create_dir_all(&camera_root).unwrap();
        let adhoc_running = Arc::new(AtomicBool::new(false));
        let creation = Arc::new(Stamped {
            camera_root: camera_root.clone(),
            adhoc_running: Arc::clone(&adhoc_running),
            violations: AtomicUsize::new(0),
        });
        Site { tmp, camera_root, creation, adhoc_running }
    }

    fn db_path(&self) -> PathBuf {
        self.tmp.path().join("packcam.db")
    }

    fn config(&self) -> SchedulerConfig {
        let zone = Zone { x: 0, y: 0, width: 320, height: 240 };
        let mut config = SchedulerConfig::with_cameras(vec![CameraConfig {
            id: CAMERA.to_string(),
            root: self.camera_root.clone(),
            enabled: true,
            packing_zone: Some(zone),
            trigger_zone: Some(zone),
        }]);
        config.sync_interval_secs = 1;
        config.min_batch = 1;
        config.max_batch = 2;
        config
    }

    fn add_files(&self, names: &[&str]) {
        for name in names {
            std::fs::write(self.camera_root.join(name), b"not really a video").unwrap();
        }
    }

    fn scheduler_with(&self, source: Arc<dyn ConfigSource>) -> Scheduler {
        let frames = Frames {
            late_file: self.camera_root.join("late.mp4"),
            adhoc_running: Arc::clone(&self.adhoc_running),
        };
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(parse_user_time("2024-03-10T12:00:00Z", chrono_tz::Tz::UTC).unwrap()));
        Scheduler::builder(self.db_path(), source)
            .creation_source(Arc::clone(&self.creation) as Arc<dyn CreationTimeSource>)
            .pipeline(Pipeline::new(Arc::new(frames), Arc::new(Packer), Arc::new(NoCodes)))
            .clock(clock)
            .load_sampler(Arc::new(FixedLoad(Some(0.1))))
            .build()
            .unwrap()
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler_with(Arc::new(StaticConfig::new(self.config())))
    }

    fn conn(&self) -> Connection {
        db::open_worker_connection(&self.db_path()).unwrap()
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn test_state_machine() {
    let site = Site::new();
    let scheduler = site.scheduler();
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Stopped);
    assert!(matches!(scheduler.pause(), Err(PackError::InvalidState(_))));
    assert!(matches!(scheduler.resume(), Err(PackError::InvalidState(_))));
    scheduler.stop().unwrap();

    scheduler.start(DiscoveryRequest::Continuous).unwrap();
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Running);
    assert!(matches!(
        scheduler.start(DiscoveryRequest::Continuous),
        Err(PackError::InvalidState(_))
    ));

    scheduler.pause().unwrap();
    scheduler.pause().unwrap();
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Paused);
    scheduler.resume().unwrap();
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Running);

    scheduler.stop().unwrap();
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Stopped);
    scheduler.stop().unwrap();

    // A stopped scheduler can be started again
    scheduler.start(DiscoveryRequest::BulkBackfill { days: 1 }).unwrap();
    scheduler.stop().unwrap();
}

#[test]
fn test_continuous_run_processes_new_files() {
    let site = Site::new();
    site.add_files(&["a.mp4", "b.mp4"]);
    let scheduler = site.scheduler();
    scheduler.start(DiscoveryRequest::Continuous).unwrap();

    wait_until("both files done", || {
        let p = scheduler.get_progress().unwrap();
        p.done == 2 && p.processed_this_run == 2
    });
    let progress = scheduler.get_progress().unwrap();
    assert_eq!(progress.total, 2);
    assert_eq!(progress.processed_this_run, 2);
    scheduler.stop().unwrap();

    let events = schema::find_events(&site.conn(), &schema::EventQuery::default()).unwrap();
    assert_eq!(events.len(), 2);
    // File start 10:00 plus the 10s offset of the first hand frame
    let expected = parse_user_time("2024-03-10T10:00:10Z", chrono_tz::Tz::UTC).unwrap();
    assert!(events.iter().all(|e| e.start == expected && e.duration_ms == 25_000));
}

#[test]
fn test_pause_holds_scanning_until_resume() {
    let site = Site::new();
    let scheduler = site.scheduler();
    scheduler.start(DiscoveryRequest::Continuous).unwrap();
    scheduler.pause().unwrap();

    site.add_files(&["while-paused.mp4"]);
    std::thread::sleep(Duration::from_millis(2_500));
    assert_eq!(scheduler.get_progress().unwrap().total, 0);
    assert!(scheduler.list_pending_jobs(10).unwrap().is_empty());

    scheduler.resume().unwrap();
    wait_until("paused file processed", || scheduler.get_progress().unwrap().done == 1);
    scheduler.stop().unwrap();
}

#[test]
fn test_adhoc_preempts_continuous_and_resumes() {
    let site = Site::new();
    site.add_files(&["a.mp4", "b.mp4"]);
    let scheduler = site.scheduler();
    scheduler.start(DiscoveryRequest::Continuous).unwrap();
    wait_until("continuous files done", || scheduler.get_progress().unwrap().done == 2);

    let conn = site.conn();
    let before = schema::list_file_jobs(&conn, None, 10).unwrap();

    let manual = site.tmp.path().join("manual");
    std::fs::create_dir_all(&manual).unwrap();
    let adhoc = manual.join("adhoc-return.mp4");
    std::fs::write(&adhoc, b"disputed parcel").unwrap();

    let report = scheduler.run_adhoc(&adhoc, Some(CAMERA)).unwrap();
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].outcome, Ok(JobOutcome::Done { events: 1 }));
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Running);

    // No discovery ran while the ad-hoc file was being processed
    assert_eq!(site.creation.violations.load(Ordering::SeqCst), 0);

    let job = schema::find_file_job(&conn, &adhoc.to_string_lossy(), DiscoveryMode::AdHoc)
        .unwrap()
        .unwrap();
    assert_eq!(job.priority, PRIORITY_AD_HOC);
    assert_eq!(job.status, JobStatus::Done);

    // Earlier rows are exactly as they were
    for old in &before {
        let now = schema::get_file_job(&conn, old.id).unwrap().unwrap();
        assert_eq!(now.status, old.status);
        assert_eq!(now.mode, DiscoveryMode::Continuous);
        assert_eq!(now.completed_at, old.completed_at);
    }

    // Scanning resumed and picked up the file that arrived meanwhile
    wait_until("late file done", || {
        schema::find_file_job(&conn, &site.camera_root.join("late.mp4").to_string_lossy(), DiscoveryMode::Continuous)
            .unwrap()
            .map(|j| j.status == JobStatus::Done)
            .unwrap_or(false)
    });
    scheduler.stop().unwrap();
}

fn manual_files(site: &Site, names: &[&str]) -> PathBuf {
    let manual = site.tmp.path().join("manual");
    std::fs::create_dir_all(&manual).unwrap();
    for name in names {
        std::fs::write(manual.join(name), b"disputed parcel").unwrap();
    }
    manual
}

#[test]
fn test_stop_during_adhoc_keeps_every_result() {
    let site = Site::new();
    let scheduler = site.scheduler();
    scheduler.start(DiscoveryRequest::Continuous).unwrap();
    let manual = manual_files(&site, &["adhoc-1.mp4", "adhoc-2.mp4", "adhoc-3.mp4"]);

    // Two workers, three files: one is still queued when stop() lands
    let report = std::thread::scope(|s| {
        let stopper = s.spawn(|| {
            wait_until("ad-hoc file sampling", || site.adhoc_running.load(Ordering::SeqCst));
            scheduler.stop().unwrap();
        });
        let report = scheduler.run_adhoc(&manual, Some(CAMERA)).unwrap();
        stopper.join().unwrap();
        report
    });

    assert_eq!(report.scan.enqueued.len(), 3);
    assert_eq!(report.results.len(), 3);
    for result in &report.results {
        assert_eq!(result.outcome, Ok(JobOutcome::Done { events: 1 }));
    }
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Stopped);
    let conn = site.conn();
    assert!(schema::list_file_jobs(&conn, Some(JobStatus::Processing), 10).unwrap().is_empty());
}

#[test]
fn test_adhoc_runs_inline_when_pool_refuses_jobs() {
    let site = Site::new();
    let scheduler = site.scheduler();
    let manual = manual_files(&site, &["adhoc-a.mp4", "adhoc-b.mp4"]);

    // A pool that stop() already shut down but process_adhoc still sees
    let pool = WorkerPool::spawn(
        1,
        &site.db_path(),
        scheduler.inner.pipeline.clone(),
        Arc::clone(&scheduler.inner.clock),
    )
    .unwrap();
    pool.shutdown().unwrap();
    *scheduler.inner.pool.lock().unwrap() = Some(Arc::new(pool));

    let report = scheduler.run_adhoc(&manual, Some(CAMERA)).unwrap();
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.outcome == Ok(JobOutcome::Done { events: 1 })));
    assert!(report.results[0].job_id < report.results[1].job_id);

    let conn = site.conn();
    assert!(schema::list_file_jobs(&conn, Some(JobStatus::Processing), 10).unwrap().is_empty());
    assert_eq!(schema::list_file_jobs(&conn, Some(JobStatus::Done), 10).unwrap().len(), 2);
}

#[test]
fn test_adhoc_on_stopped_scheduler_runs_inline() {
    let site = Site::new();
    site.add_files(&["manual.mp4"]);
    let scheduler = site.scheduler();

    let report = scheduler.run_adhoc(&site.camera_root.join("manual.mp4"), None).unwrap();
    assert_eq!(report.scan.enqueued.len(), 1);
    assert_eq!(report.results[0].outcome, Ok(JobOutcome::Done { events: 1 }));
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Stopped);
    assert_eq!(scheduler.get_progress().unwrap().processed_this_run, 1);

    // Outside every camera root and no camera given
    let stray = site.tmp.path().join("stray.mp4");
    std::fs::write(&stray, b"x").unwrap();
    assert!(matches!(scheduler.run_adhoc(&stray, None), Err(PackError::Config(_))));
}

#[test]
fn test_failed_reload_keeps_last_good_config() {
    let site = Site::new();
    site.add_files(&["a.mp4"]);
    let source = Arc::new(FlakyConfig {
        config: site.config(),
        calls: AtomicUsize::new(0),
    });
    let scheduler = site.scheduler_with(source);
    scheduler.start(DiscoveryRequest::Continuous).unwrap();

    wait_until("file done despite reload failures", || scheduler.get_progress().unwrap().done == 1);
    assert_eq!(scheduler.config().cameras.len(), 1);
    scheduler.stop().unwrap();
}

#[test]
fn test_start_rejects_adhoc_request() {
    let site = Site::new();
    let scheduler = site.scheduler();
    let request = DiscoveryRequest::AdHoc {
        path: site.camera_root.clone(),
        camera: None,
    };
    assert!(matches!(scheduler.start(request), Err(PackError::InvalidState(_))));
    assert_eq!(scheduler.state().unwrap(), SchedulerState::Stopped);
}
