// PackCam Constants
// Defaults for every SchedulerConfig field that may be omitted from the config file.

// Paths
pub const APP_NAME: &str = "packcam";
pub const DB_FILENAME: &str = "packcam.db";
pub const FRAME_FILE_PATTERN: &str = "frame_%06d.jpg";

// Time
pub const DEFAULT_SITE_TIMEZONE: &str = "UTC";

// Event correlation
pub const DEFAULT_MIN_PACKING_SECS: u64 = 5;
pub const DEFAULT_MAX_PACKING_SECS: u64 = 120;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 3000;

// Working window
pub const DEFAULT_WORK_START: &str = "00:00";
pub const DEFAULT_WORK_END: &str = "23:59";

// Scheduling
pub const DEFAULT_QUEUE_DEPTH_CAP: usize = 500;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 900; // 15 minutes
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_MIN_BATCH: usize = 1;
pub const DISPATCH_IDLE_MS: u64 = 2000;
pub const DISPATCH_BUSY_MS: u64 = 250;
pub const RECLAIM_INTERVAL_SECS: i64 = 30;
pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;

// Adaptive pool size: load fraction at which the pool is at max / min size
pub const LOAD_LOW_WATER: f32 = 0.30;
pub const LOAD_HIGH_WATER: f32 = 0.90;

// Job priorities (higher runs first)
pub const PRIORITY_AD_HOC: i32 = 100;
pub const PRIORITY_CONTINUOUS: i32 = 10;
pub const PRIORITY_BULK_BACKFILL: i32 = 0;

// External detector
pub const DETECTOR_TIMEOUT_SECS: u64 = 30;

// Video extensions (primary supported formats)
pub const VIDEO_EXTENSIONS: [&str; 14] = [
    "mp4", "mov", "avi", "mkv", "mts", "m2ts", "mpg", "mpeg",
    "wmv", "flv", "webm", "3gp", "m4v", "ts",
];
