// ffmpeg-backed frame extraction

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::constants::FRAME_FILE_PATTERN;
use crate::error::{PackError, Result};
use super::{frame_offset_ms, Frame, FrameSource};

#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    ffmpeg: PathBuf,
}

impl FfmpegFrameSource {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }
}

/// `fps` filter expression for one frame every `interval_ms`.
pub fn fps_filter(interval_ms: u64) -> String {
    format!("fps=1000/{}", interval_ms.max(1))
}

impl FrameSource for FfmpegFrameSource {
    fn extract(&self, video: &Path, interval_ms: u64, scratch: &Path) -> Result<Vec<Frame>> {
        if !video.exists() {
            return Err(PackError::FileNotFound(video.display().to_string()));
        }

        let pattern = scratch.join(FRAME_FILE_PATTERN);
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-y", "-i"])
            .arg(video)
            .args(["-vf", &fps_filter(interval_ms), "-q:v", "3"])
            .arg(&pattern)
            .stdout(Stdio::null())
            .output()
            .map_err(|e| PackError::FFmpeg(format!("Failed to start FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PackError::FFmpeg(format!(
                "frame extraction failed for {}: {}",
                video.display(),
                stderr.trim()
            )));
        }

        collect_frames(scratch, interval_ms)
    }
}

/// Read back `frame_000001.jpg`-style files; ffmpeg numbers from 1.
fn collect_frames(scratch: &Path, interval_ms: u64) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(scratch)? {
        let path = entry?.path();
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("frame_"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(n) = number.filter(|n| *n > 0) {
            let index = n - 1;
            frames.push(Frame {
                index,
                offset_ms: frame_offset_ms(index, interval_ms),
                path,
            });
        }
    }
    frames.sort_by_key(|f| f.index);
    Ok(frames)
}
