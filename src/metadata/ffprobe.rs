// FFprobe wrapper: container duration and creation time

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::error::{PackError, Result};

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    duration: Option<String>,
    tags: Option<FFprobeTags>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
    tags: Option<FFprobeTags>,
}

#[derive(Debug, Deserialize)]
struct FFprobeTags {
    creation_time: Option<String>,
    #[serde(rename = "com.apple.quicktime.creationdate")]
    quicktime_creation_date: Option<String>,
}

impl FFprobeTags {
    fn creation(&self) -> Option<&str> {
        self.quicktime_creation_date
            .as_deref()
            .or(self.creation_time.as_deref())
            .filter(|s| !s.trim().is_empty())
    }
}

/// What the pipeline needs from a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeInfo {
    pub duration_ms: Option<i64>,
    /// Raw creation timestamp string, not yet normalized.
    pub creation_time: Option<String>,
}

/// Run ffprobe on a file
pub fn probe(path: &Path) -> Result<ProbeInfo> {
    let output = Command::new(crate::tools::ffprobe_path())
        .args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| PackError::FFprobe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PackError::FFprobe(format!("ffprobe failed on {}: {}", path.display(), stderr.trim())));
    }

    parse_output(&output.stdout)
}

fn parse_output(stdout: &[u8]) -> Result<ProbeInfo> {
    let probe_output: FFprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| PackError::FFprobe(format!("Failed to parse ffprobe output: {}", e)))?;

    let mut info = ProbeInfo::default();

    // Container-level values take precedence over stream-level ones
    if let Some(ref format) = probe_output.format {
        info.duration_ms = parse_duration_ms(format.duration.as_deref());
        info.creation_time = format.tags.as_ref().and_then(|t| t.creation()).map(str::to_string);
    }

    for stream in probe_output.streams.iter().flatten() {
        if stream.codec_type.as_deref() != Some("video") {
            continue;
        }
        if info.duration_ms.is_none() {
            info.duration_ms = parse_duration_ms(stream.duration.as_deref());
        }
        if info.creation_time.is_none() {
            info.creation_time = stream.tags.as_ref().and_then(|t| t.creation()).map(str::to_string);
        }
    }

    Ok(info)
}

/// Parse duration string to milliseconds
fn parse_duration_ms(duration_str: Option<&str>) -> Option<i64> {
    let seconds: f64 = duration_str?.parse().ok()?;
    Some((seconds * 1000.0) as i64)
}
