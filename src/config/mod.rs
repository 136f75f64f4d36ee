// Scheduler configuration
//
// SchedulerConfig is owned by the configuration subsystem. The core only reads
// it, through a ConfigSource, and may receive a fresh snapshot on every scan.

pub mod loader;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::clock::CanonicalTime;
use crate::constants::*;
use crate::error::{PackError, Result};

pub use loader::{ConfigSource, JsonConfigFile, StaticConfig};

/// Rectangular region of a camera frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Zone {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Which detectors run and whether an event needs a tracking code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Hand detection only; the QR decoder is never called.
    HandOnly,
    /// Hand detection plus QR decoding; events without codes are kept.
    #[default]
    HandAndQr,
    /// Hand detection plus QR decoding; events without codes are dropped.
    RequireCode,
}

impl ScanMode {
    pub fn decodes_codes(self) -> bool {
        !matches!(self, ScanMode::HandOnly)
    }

    pub fn requires_code(self) -> bool {
        matches!(self, ScanMode::RequireCode)
    }
}

/// Where an over-long run of hand activity is cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Cut exactly every `max_packing_time`.
    #[default]
    FixedBoundary,
    /// Cut at the latest brief hand-absent frame that keeps the piece in
    /// bounds, falling back to the fixed boundary.
    NaturalGap,
}

/// Days of week and time-of-day window used by continuous discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingHours {
    #[serde(default = "all_days")]
    pub days: Vec<Weekday>,
    #[serde(default = "default_work_start", with = "hhmm")]
    pub start: NaiveTime,
    #[serde(default = "default_work_end", with = "hhmm")]
    pub end: NaiveTime,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            days: all_days(),
            start: default_work_start(),
            end: default_work_end(),
        }
    }
}

impl WorkingHours {
    /// True when `t`, seen as wall-clock time in `tz`, falls inside the window.
    /// A window whose end is before its start wraps past midnight.
    ///
    /// Both bounds are whole minutes and both are inclusive: with `end`
    /// 22:00 the window closes at 22:00:59.999, and the default 23:59 end
    /// runs to midnight.
    pub fn contains(&self, t: CanonicalTime, tz: Tz) -> bool {
        let local = t.in_zone(tz);
        if !self.days.contains(&local.weekday()) {
            return false;
        }
        let time = NaiveTime::from_hms_opt(local.hour(), local.minute(), 0).unwrap_or_default();
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

/// One camera: where its footage lands and which zones to inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub root: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub packing_zone: Option<Zone>,
    #[serde(default)]
    pub trigger_zone: Option<Zone>,
}

/// Validated zones for one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraZones {
    pub packing: Zone,
    pub trigger: Option<Zone>,
}

impl CameraConfig {
    pub fn validate(&self, scan_mode: ScanMode) -> Result<()> {
        self.zones(scan_mode).map(|_| ())
    }

    /// Check this camera can be scanned under `scan_mode`.
    pub fn zones(&self, scan_mode: ScanMode) -> Result<CameraZones> {
        let packing = self.packing_zone.ok_or_else(|| self.misconfigured("missing packing_zone"))?;
        if packing.is_empty() {
            return Err(self.misconfigured("packing_zone has zero size"));
        }

        let trigger = if scan_mode.decodes_codes() {
            let zone = self.trigger_zone.ok_or_else(|| {
                self.misconfigured("scan_mode decodes codes but trigger_zone is missing")
            })?;
            if zone.is_empty() {
                return Err(self.misconfigured("trigger_zone has zero size"));
            }
            Some(zone)
        } else {
            None
        };

        Ok(CameraZones { packing, trigger })
    }

    fn misconfigured(&self, reason: &str) -> PackError {
        PackError::CameraConfig {
            camera: self.id.clone(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Site timezone: metadata timestamps without an offset are read in it,
    /// and the working window is evaluated in it.
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    pub cameras: Vec<CameraConfig>,
    #[serde(default = "default_min_packing")]
    pub min_packing_time_secs: u64,
    #[serde(default = "default_max_packing")]
    pub max_packing_time_secs: u64,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_stability_window")]
    pub stability_window_ms: u64,
    #[serde(default)]
    pub scan_mode: ScanMode,
    #[serde(default)]
    pub split_policy: SplitPolicy,
    #[serde(default)]
    pub working_hours: WorkingHours,
    #[serde(default = "default_queue_depth_cap")]
    pub queue_depth_cap: usize,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_min_batch")]
    pub min_batch: usize,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default)]
    pub tracking_code_pattern: Option<String>,
    #[serde(default)]
    pub retain_detections: bool,
}

impl SchedulerConfig {
    /// Config with defaults for everything but the cameras.
    pub fn with_cameras(cameras: Vec<CameraConfig>) -> Self {
        Self {
            timezone: default_timezone(),
            cameras,
            min_packing_time_secs: default_min_packing(),
            max_packing_time_secs: default_max_packing(),
            frame_interval_ms: default_frame_interval(),
            stability_window_ms: default_stability_window(),
            scan_mode: ScanMode::default(),
            split_policy: SplitPolicy::default(),
            working_hours: WorkingHours::default(),
            queue_depth_cap: default_queue_depth_cap(),
            sync_interval_secs: default_sync_interval(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            min_batch: default_min_batch(),
            max_batch: default_max_batch(),
            tracking_code_pattern: None,
            retain_detections: false,
        }
    }

    /// Global invariants. A failure here is fatal at startup; per-camera
    /// problems are reported by `CameraConfig::zones` at scan time instead.
    pub fn validate(&self) -> Result<()> {
        if self.min_packing_time_secs > self.max_packing_time_secs {
            return Err(PackError::Config(format!(
                "min_packing_time_secs ({}) exceeds max_packing_time_secs ({})",
                self.min_packing_time_secs, self.max_packing_time_secs
            )));
        }
        if self.max_packing_time_secs == 0 {
            return Err(PackError::Config("max_packing_time_secs must be > 0".to_string()));
        }
        // Over-long runs are cut in two pieces that must both reach the minimum
        if self.max_packing_time_secs < 2 * self.min_packing_time_secs {
            return Err(PackError::Config(format!(
                "max_packing_time_secs ({}) must be at least twice min_packing_time_secs ({})",
                self.max_packing_time_secs, self.min_packing_time_secs
            )));
        }
        if self.frame_interval_ms == 0 {
            return Err(PackError::Config("frame_interval_ms must be > 0".to_string()));
        }
        if self.min_batch == 0 {
            return Err(PackError::Config("min_batch must be >= 1".to_string()));
        }
        if self.min_batch > self.max_batch {
            return Err(PackError::Config(format!(
                "min_batch ({}) exceeds max_batch ({})",
                self.min_batch, self.max_batch
            )));
        }
        if self.max_retries < 0 {
            return Err(PackError::Config("max_retries must be >= 0".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(PackError::Config("timeout_secs must be > 0".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id.as_str()) {
                return Err(PackError::Config(format!("duplicate camera id '{}'", camera.id)));
            }
        }

        self.tracking_code_regex()?;
        Ok(())
    }

    pub fn tracking_code_regex(&self) -> Result<Option<regex::Regex>> {
        match self.tracking_code_pattern.as_deref() {
            Some(p) if !p.trim().is_empty() => regex::Regex::new(p)
                .map(Some)
                .map_err(|e| PackError::Config(format!("invalid tracking_code_pattern: {}", e))),
            _ => Ok(None),
        }
    }

    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Camera whose root contains `path` (the deepest root wins).
    pub fn camera_for_path(&self, path: &Path) -> Option<&CameraConfig> {
        self.cameras
            .iter()
            .filter(|c| path.starts_with(&c.root))
            .max_by_key(|c| c.root.components().count())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_packing_ms(&self) -> i64 {
        (self.min_packing_time_secs * 1000) as i64
    }

    pub fn max_packing_ms(&self) -> i64 {
        (self.max_packing_time_secs * 1000) as i64
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> Tz {
    DEFAULT_SITE_TIMEZONE.parse().unwrap_or(Tz::UTC)
}

fn default_min_packing() -> u64 {
    DEFAULT_MIN_PACKING_SECS
}

fn default_max_packing() -> u64 {
    DEFAULT_MAX_PACKING_SECS
}

fn default_frame_interval() -> u64 {
    DEFAULT_FRAME_INTERVAL_MS
}

fn default_stability_window() -> u64 {
    DEFAULT_STABILITY_WINDOW_MS
}

fn default_queue_depth_cap() -> usize {
    DEFAULT_QUEUE_DEPTH_CAP
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> i32 {
    DEFAULT_MAX_RETRIES
}

fn default_min_batch() -> usize {
    DEFAULT_MIN_BATCH
}

fn default_max_batch() -> usize {
    num_cpus::get().max(DEFAULT_MIN_BATCH)
}

fn all_days() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
}

fn default_work_start() -> NaiveTime {
    NaiveTime::parse_from_str(DEFAULT_WORK_START, "%H:%M").unwrap_or(NaiveTime::MIN)
}

fn default_work_end() -> NaiveTime {
    NaiveTime::parse_from_str(DEFAULT_WORK_END, "%H:%M").unwrap_or(NaiveTime::MIN)
}

/// `HH:MM` serde format for NaiveTime.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_user_time;

    fn camera(id: &str, root: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            root: PathBuf::from(root),
            enabled: true,
            packing_zone: Some(Zone { x: 0, y: 0, width: 640, height: 480 }),
            trigger_zone: Some(Zone { x: 10, y: 10, width: 100, height: 100 }),
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "timezone": "Asia/Ho_Chi_Minh",
            "cameras": [{"id": "cam-1", "root": "/videos/cam1",
                         "packing_zone": {"x": 0, "y": 0, "width": 640, "height": 480}}],
            "scan_mode": "hand_only",
            "working_hours": {"days": ["Mon", "Tue"], "start": "08:00", "end": "18:30"}
        }"#;
        let config: SchedulerConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.timezone, chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(config.min_packing_time_secs, DEFAULT_MIN_PACKING_SECS);
        assert_eq!(config.split_policy, SplitPolicy::FixedBoundary);
        assert_eq!(config.working_hours.days, vec![Weekday::Mon, Weekday::Tue]);
        assert_eq!(config.working_hours.end, NaiveTime::from_hms_opt(18, 30, 0).unwrap());
        assert!(config.cameras[0].enabled);
        assert!(config.max_batch >= 1);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = SchedulerConfig::with_cameras(vec![camera("a", "/a")]);
        config.min_packing_time_secs = 200;
        config.max_packing_time_secs = 100;
        assert!(matches!(config.validate(), Err(PackError::Config(_))));

        let mut config = SchedulerConfig::with_cameras(vec![camera("a", "/a")]);
        config.min_packing_time_secs = 60;
        config.max_packing_time_secs = 90;
        assert!(matches!(config.validate(), Err(PackError::Config(_))));

        let mut config = SchedulerConfig::with_cameras(vec![camera("a", "/a")]);
        config.min_batch = 4;
        config.max_batch = 2;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::with_cameras(vec![camera("a", "/a"), camera("a", "/b")]);
        config.max_batch = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let mut config = SchedulerConfig::with_cameras(vec![]);
        config.tracking_code_pattern = Some("([".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camera_zone_errors() {
        let mut cam = camera("c", "/c");
        cam.trigger_zone = None;
        assert!(cam.zones(ScanMode::HandOnly).is_ok());
        assert!(matches!(cam.zones(ScanMode::HandAndQr), Err(PackError::CameraConfig { .. })));

        cam.packing_zone = None;
        assert!(cam.zones(ScanMode::HandOnly).is_err());
    }

    #[test]
    fn test_camera_for_path_prefers_deepest_root() {
        let config = SchedulerConfig::with_cameras(vec![
            camera("outer", "/videos"),
            camera("inner", "/videos/dock2"),
        ]);
        let found = config.camera_for_path(Path::new("/videos/dock2/a.mp4")).unwrap();
        assert_eq!(found.id, "inner");
        assert_eq!(config.camera_for_path(Path::new("/videos/x.mp4")).unwrap().id, "outer");
        assert!(config.camera_for_path(Path::new("/elsewhere/x.mp4")).is_none());
    }

    #[test]
    fn test_working_hours_window() {
        let tz = chrono_tz::Asia::Ho_Chi_Minh;
        let hours = WorkingHours {
            days: vec![Weekday::Sun],
            start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        };
        // 2024-03-10 is a Sunday
        assert!(hours.contains(parse_user_time("2024-03-10 09:00:00", tz).unwrap(), tz));
        assert!(!hours.contains(parse_user_time("2024-03-10 19:00:00", tz).unwrap(), tz));
        assert!(!hours.contains(parse_user_time("2024-03-11 09:00:00", tz).unwrap(), tz));
    }

    #[test]
    fn test_window_bounds_are_whole_minutes() {
        let tz = Tz::UTC;
        let at = |s: &str| parse_user_time(s, tz).unwrap();
        let hours = WorkingHours {
            days: all_days(),
            start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        };
        assert!(!hours.contains(at("2024-03-10 07:59:59"), tz));
        assert!(hours.contains(at("2024-03-10 08:00:00"), tz));
        assert!(hours.contains(at("2024-03-10 22:00:59"), tz));
        assert!(!hours.contains(at("2024-03-10 22:01:00"), tz));

        let defaults = WorkingHours::default();
        assert!(defaults.contains(at("2024-03-10 23:59:59"), tz));
    }

    #[test]
    fn test_overnight_window_wraps() {
        let hours = WorkingHours {
            days: all_days(),
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        let tz = Tz::UTC;
        assert!(hours.contains(parse_user_time("2024-03-10 23:30:00", tz).unwrap(), tz));
        assert!(hours.contains(parse_user_time("2024-03-10 05:59:00", tz).unwrap(), tz));
        assert!(!hours.contains(parse_user_time("2024-03-10 12:00:00", tz).unwrap(), tz));
    }
}
