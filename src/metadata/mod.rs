// Creation-time lookup for discovered files
//
// Metadata first, then filesystem mtime. The result is a typed CreationTime
// so discovery must decide what to do with a degraded or missing value.

pub mod ffprobe;

use std::path::Path;

use chrono_tz::Tz;

use crate::clock::{parse_source_time, to_canonical, CreationTime, SourceTime};
use crate::constants::VIDEO_EXTENSIONS;
use crate::error::{PackError, Result};

/// Reads the creation timestamp embedded in a video file.
pub trait CreationTimeSource: Send + Sync {
    /// `Ok(None)` when the file has no usable timestamp.
    fn get_video_creation_time(&self, path: &Path) -> Result<Option<SourceTime>>;
}

/// ffprobe-backed creation time.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfprobeCreationTime;

impl CreationTimeSource for FfprobeCreationTime {
    fn get_video_creation_time(&self, path: &Path) -> Result<Option<SourceTime>> {
        let info = ffprobe::probe(path)?;
        match info.creation_time {
            Some(raw) => match parse_source_time(&raw) {
                Some(ts) => Ok(Some(ts)),
                None => Err(PackError::FFprobe(format!("unrecognized creation_time '{}'", raw))),
            },
            None => Ok(None),
        }
    }
}

/// Resolve a file's creation time in canonical time.
///
/// Offset-less metadata is read in `site_tz`. When metadata is missing or
/// unreadable the filesystem mtime is used and the reason is logged.
pub fn resolve_creation_time(source: &dyn CreationTimeSource, path: &Path, site_tz: Tz) -> CreationTime {
    let reason = match source.get_video_creation_time(path) {
        Ok(Some(ts)) => return CreationTime::Metadata(to_canonical(ts, site_tz)),
        Ok(None) => "no creation time in metadata".to_string(),
        Err(e) => format!("metadata unreadable: {}", e),
    };

    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => {
            log::warn!("Using filesystem mtime for {} ({})", path.display(), reason);
            CreationTime::FallbackUsed {
                time: to_canonical(SourceTime::System(mtime), site_tz),
                reason,
            }
        }
        Err(e) => CreationTime::Unavailable {
            reason: format!("{}; mtime unavailable: {}", reason, e),
        },
    }
}

/// True for files with a known video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}
