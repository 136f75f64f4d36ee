// PackCam - Library Entry Point
//
// Discovers recorded camera files, queues them in SQLite, and turns each
// file into packing events (hand in the packing zone, plus any tracking
// codes seen while it was there).

pub mod clock;
pub mod config;
pub mod constants;
pub mod correlate;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod metadata;
pub mod sampler;
pub mod scheduler;
pub mod tools;

pub use clock::{CanonicalTime, Clock, SystemClock};
pub use config::{ConfigSource, JsonConfigFile, SchedulerConfig};
pub use error::{PackError, Result};
pub use ingest::DiscoveryRequest;
pub use scheduler::{Scheduler, SchedulerState};
