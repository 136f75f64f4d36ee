// Discovery scenarios: backfill window, idempotent rescans, timezone
// consistency, queue cap, camera isolation, ad-hoc requests

use super::*;
use std::collections::HashMap;

use chrono_tz::Tz;
use tempfile::TempDir;

use crate::clock::{parse_source_time, parse_user_time, to_canonical, ManualClock, SourceTime};
use crate::config::Zone;
use crate::db::schema::JobStatus;

/// Creation times keyed by file name; files not listed have no metadata.
struct FakeCreation(HashMap<String, &'static str>);

impl FakeCreation {
    fn none() -> Self {
        FakeCreation(HashMap::new())
    }

    fn with(entries: &[(&str, &'static str)]) -> Self {
        FakeCreation(entries.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

impl CreationTimeSource for FakeCreation {
    fn get_video_creation_time(&self, path: &Path) -> Result<Option<SourceTime>> {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        Ok(self.0.get(&name).and_then(|raw| parse_source_time(raw)))
    }
}

fn setup_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
    crate::db::migrations::run_migrations(&conn).unwrap();
    conn
}

fn camera(id: &str, root: &Path) -> CameraConfig {
    CameraConfig {
        id: id.to_string(),
        root: root.to_path_buf(),
        enabled: true,
        packing_zone: Some(Zone { x: 0, y: 0, width: 640, height: 480 }),
        trigger_zone: Some(Zone { x: 0, y: 0, width: 100, height: 100 }),
    }
}

fn touch(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), b"not really a video").unwrap();
    }
}

fn clock_at(utc: &str) -> ManualClock {
    ManualClock::new(parse_user_time(utc, Tz::UTC).unwrap())
}

fn count_jobs(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM file_jobs", [], |row| row.get(0)).unwrap()
}

// ---------------------------------------------------------------
// Backfill: days=1 over 3 files (2 recent, 1 old) enqueues exactly 2
// ---------------------------------------------------------------
#[test]
fn test_backfill_one_day_enqueues_recent_files() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    touch(&root, &["recent1.mp4", "recent2.mp4", "old.mp4"]);

    let clock = clock_at("2024-03-10T12:00:00Z");
    let now_secs = clock.now().millis() / 1000;
    for (name, age_secs) in [("recent1.mp4", 2 * 3600), ("recent2.mp4", 10 * 3600), ("old.mp4", 3 * 86_400)] {
        let mtime = filetime::FileTime::from_unix_time(now_secs - age_secs, 0);
        filetime::set_file_mtime(root.join(name), mtime).unwrap();
    }

    let config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    let creation = FakeCreation::none();
    let conn = setup_db();

    let report = Discoverer::new(&config, &creation, &clock)
        .discover(&conn, &DiscoveryRequest::BulkBackfill { days: 1 })
        .unwrap();

    assert_eq!(report.enqueued.len(), 2);
    assert_eq!(count_jobs(&conn), 2);

    let jobs = schema::list_file_jobs(&conn, None, 10).unwrap();
    assert!(jobs.iter().all(|j| j.mode == DiscoveryMode::BulkBackfill));
    assert!(jobs.iter().all(|j| j.created_at_source == "filesystem"));
    assert!(jobs.iter().all(|j| !j.path.ends_with("old.mp4")));

    // Watermark moves to the newest backfilled file
    let mark = schema::get_watermark(&conn, "cam-1").unwrap().unwrap();
    assert_eq!(mark, clock.now().minus_secs(2 * 3600));
}

// ---------------------------------------------------------------
// Continuous discovery twice with no new files adds nothing
// ---------------------------------------------------------------
#[test]
fn test_continuous_rescan_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    touch(&root, &["a.mp4", "b.mp4", "yesterday.mp4"]);

    let creation = FakeCreation::with(&[
        ("a.mp4", "2024-03-10T08:00:00Z"),
        ("b.mp4", "2024-03-10T09:30:00Z"),
        ("yesterday.mp4", "2024-03-09T23:00:00Z"),
    ]);
    let clock = clock_at("2024-03-10T12:00:00Z");
    let config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    let conn = setup_db();
    let discoverer = Discoverer::new(&config, &creation, &clock);

    let first = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert_eq!(first.enqueued.len(), 2);

    clock.advance_secs(60);
    let second = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert!(second.enqueued.is_empty());
    assert_eq!(count_jobs(&conn), 2);

    // A new file after the watermark is picked up
    touch(&root, &["c.mp4"]);
    let creation = FakeCreation::with(&[
        ("a.mp4", "2024-03-10T08:00:00Z"),
        ("b.mp4", "2024-03-10T09:30:00Z"),
        ("yesterday.mp4", "2024-03-09T23:00:00Z"),
        ("c.mp4", "2024-03-10T11:59:00Z"),
    ]);
    let third = Discoverer::new(&config, &creation, &clock)
        .discover(&conn, &DiscoveryRequest::Continuous)
        .unwrap();
    assert_eq!(third.enqueued.len(), 1);
    assert_eq!(count_jobs(&conn), 3);
}

// ---------------------------------------------------------------
// Stored creation time is the canonical conversion of local metadata
// ---------------------------------------------------------------
#[test]
fn test_creation_time_normalized_from_site_timezone() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    touch(&root, &["morning.mp4"]);

    let tz = chrono_tz::Asia::Ho_Chi_Minh;
    let creation = FakeCreation::with(&[("morning.mp4", "2024-03-10 09:00:00")]);
    let clock = clock_at("2024-03-10T05:00:00Z");
    let mut config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    config.timezone = tz;
    let conn = setup_db();

    Discoverer::new(&config, &creation, &clock)
        .discover(&conn, &DiscoveryRequest::Continuous)
        .unwrap();

    let job = schema::list_file_jobs(&conn, None, 1).unwrap().remove(0);
    let expected = to_canonical(parse_source_time("2024-03-10 09:00:00").unwrap(), tz);
    assert_eq!(job.created_at, expected);
    assert_eq!(job.created_at.to_rfc3339(), "2024-03-10T02:00:00+00:00");
    assert_eq!(job.created_at_source, "metadata");
}

// ---------------------------------------------------------------
// Working window: files outside days/hours are not enqueued
// ---------------------------------------------------------------
#[test]
fn test_continuous_respects_working_window() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    touch(&root, &["early.mp4", "shift.mp4"]);

    let creation = FakeCreation::with(&[
        ("early.mp4", "2024-03-10T05:00:00Z"),
        ("shift.mp4", "2024-03-10T09:00:00Z"),
    ]);
    let clock = clock_at("2024-03-10T12:00:00Z");
    let mut config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    config.working_hours.start = chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap();
    config.working_hours.end = chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap();
    let conn = setup_db();

    let report = Discoverer::new(&config, &creation, &clock)
        .discover(&conn, &DiscoveryRequest::Continuous)
        .unwrap();
    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.outside_window, 1);
    let job = schema::list_file_jobs(&conn, None, 10).unwrap().remove(0);
    assert!(job.path.ends_with("shift.mp4"));
}

// ---------------------------------------------------------------
// Queue cap: scan stops at the cap without losing later files
// ---------------------------------------------------------------
#[test]
fn test_queue_cap_defers_without_loss() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    touch(&root, &["1.mp4", "2.mp4", "3.mp4"]);

    let creation = FakeCreation::with(&[
        ("1.mp4", "2024-03-10T08:00:00Z"),
        ("2.mp4", "2024-03-10T08:10:00Z"),
        ("3.mp4", "2024-03-10T08:20:00Z"),
    ]);
    let clock = clock_at("2024-03-10T12:00:00Z");
    let mut config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    config.queue_depth_cap = 2;
    let conn = setup_db();
    let discoverer = Discoverer::new(&config, &creation, &clock);

    let first = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert_eq!(first.enqueued.len(), 2);
    assert!(first.capped);

    let again = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert!(again.enqueued.is_empty());
    assert!(again.capped);

    // Drain one job; the deferred file now fits
    conn.execute("UPDATE file_jobs SET status = 'done' WHERE path LIKE '%1.mp4'", []).unwrap();
    let last = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert_eq!(last.enqueued.len(), 1);
    let job = schema::get_file_job(&conn, last.enqueued[0]).unwrap().unwrap();
    assert!(job.path.ends_with("3.mp4"));
    assert_eq!(job.status, JobStatus::Pending);
}

// ---------------------------------------------------------------
// A misconfigured camera fails alone; others are scanned
// ---------------------------------------------------------------
#[test]
fn test_camera_config_error_is_isolated() {
    let tmp = TempDir::new().unwrap();
    let good_root = tmp.path().join("good");
    let bad_root = tmp.path().join("bad");
    touch(&good_root, &["g.mp4"]);
    touch(&bad_root, &["b.mp4"]);

    let mut bad = camera("bad", &bad_root);
    bad.packing_zone = None;
    let missing = camera("missing-root", &tmp.path().join("unplugged"));
    let config = SchedulerConfig::with_cameras(vec![bad, missing, camera("good", &good_root)]);

    let creation = FakeCreation::with(&[("g.mp4", "2024-03-10T08:00:00Z"), ("b.mp4", "2024-03-10T08:00:00Z")]);
    let clock = clock_at("2024-03-10T12:00:00Z");
    let conn = setup_db();

    let report = Discoverer::new(&config, &creation, &clock)
        .discover(&conn, &DiscoveryRequest::Continuous)
        .unwrap();

    assert_eq!(report.enqueued.len(), 1);
    let failed: Vec<_> = report.camera_errors.iter().map(|e| e.camera.as_str()).collect();
    assert_eq!(failed, vec!["bad", "missing-root"]);
}

// ---------------------------------------------------------------
// Camera selection and disabled cameras
// ---------------------------------------------------------------
#[test]
fn test_camera_selection() {
    let tmp = TempDir::new().unwrap();
    let a_root = tmp.path().join("a");
    let b_root = tmp.path().join("b");
    let c_root = tmp.path().join("c");
    touch(&a_root, &["a.mp4"]);
    touch(&b_root, &["b.mp4"]);
    touch(&c_root, &["c.mp4"]);

    let mut c = camera("c", &c_root);
    c.enabled = false;
    let config = SchedulerConfig::with_cameras(vec![camera("a", &a_root), camera("b", &b_root), c]);
    let creation = FakeCreation::none();
    let clock = ManualClock::new(crate::clock::CanonicalTime::from_millis(0));
    let conn = setup_db();

    let only_b = vec!["b".to_string(), "c".to_string()];
    let report = Discoverer::new(&config, &creation, &clock)
        .with_cameras(&only_b)
        .discover(&conn, &DiscoveryRequest::BulkBackfill { days: 365 * 100 })
        .unwrap();

    assert_eq!(report.enqueued.len(), 1);
    let job = schema::get_file_job(&conn, report.enqueued[0]).unwrap().unwrap();
    assert_eq!(job.camera_id, "b");
}

// ---------------------------------------------------------------
// Ad-hoc: camera resolution and re-dispatch of known paths
// ---------------------------------------------------------------
#[test]
fn test_ad_hoc_requests() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cam1");
    let elsewhere = tmp.path().join("usb");
    touch(&root, &["a.mp4"]);
    touch(&elsewhere, &["x.mp4", "y.mov"]);

    let creation = FakeCreation::with(&[("a.mp4", "2024-03-10T08:00:00Z")]);
    let clock = clock_at("2024-03-10T12:00:00Z");
    let config = SchedulerConfig::with_cameras(vec![camera("cam-1", &root)]);
    let conn = setup_db();
    let discoverer = Discoverer::new(&config, &creation, &clock);

    let first = discoverer.discover(&conn, &DiscoveryRequest::Continuous).unwrap();
    assert_eq!(count_jobs(&conn), 1);

    // Same path again, but ad-hoc: the pending row is raised, not duplicated
    let report = discoverer
        .discover(&conn, &DiscoveryRequest::AdHoc { path: root.join("a.mp4"), camera: None })
        .unwrap();
    assert_eq!(report.enqueued, first.enqueued);
    assert_eq!(count_jobs(&conn), 1);
    let job = schema::get_file_job(&conn, report.enqueued[0]).unwrap().unwrap();
    assert_eq!(job.mode, DiscoveryMode::Continuous);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, crate::constants::PRIORITY_AD_HOC);
    assert_eq!(job.camera_id, "cam-1");

    // After it is done, a new request reprocesses it under its own row
    let claimed = jobs::claim_batch(&conn, 10, clock.now()).unwrap();
    assert_eq!(claimed.len(), 1);
    assert!(jobs::mark_done(&conn, &claimed[0], &[], clock.now()).unwrap());
    let rerun = discoverer
        .discover(&conn, &DiscoveryRequest::AdHoc { path: root.join("a.mp4"), camera: None })
        .unwrap();
    assert_eq!(rerun.enqueued.len(), 1);
    assert_ne!(rerun.enqueued, first.enqueued);
    let job = schema::get_file_job(&conn, rerun.enqueued[0]).unwrap().unwrap();
    assert_eq!(job.mode, DiscoveryMode::AdHoc);
    assert_eq!(count_jobs(&conn), 2);

    // Outside every root needs an explicit camera
    let err = discoverer
        .discover(&conn, &DiscoveryRequest::AdHoc { path: elsewhere.clone(), camera: None })
        .unwrap_err();
    assert!(err.is_config());

    let report = discoverer
        .discover(&conn, &DiscoveryRequest::AdHoc { path: elsewhere, camera: Some("cam-1".to_string()) })
        .unwrap();
    assert_eq!(report.enqueued.len(), 2);

    let missing = discoverer
        .discover(&conn, &DiscoveryRequest::AdHoc { path: root.join("gone.mp4"), camera: None })
        .unwrap_err();
    assert!(matches!(missing, PackError::FileNotFound(_)));
}
