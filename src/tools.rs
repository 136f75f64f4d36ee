// External program resolution (ffmpeg, ffprobe, the detector)
//
// Resolution order:
// 1) Environment variable override (PACKCAM_FFMPEG_PATH, ...)
// 2) Next to the executable, or in a bin/ directory beside it
// 3) PATH

use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
    Detector,
}

impl Tool {
    pub fn env_key(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "PACKCAM_FFMPEG_PATH",
            Tool::Ffprobe => "PACKCAM_FFPROBE_PATH",
            Tool::Detector => "PACKCAM_DETECTOR_PATH",
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
            Tool::Detector => "packcam-detector",
        }
    }
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn resolve_in(env_key: &str, default_name: &str, beside: Option<&Path>) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
        log::warn!("{} points to missing file {}, ignoring", env_key, v);
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = beside {
        for candidate in [dir.join(&filename), dir.join("bin").join(&filename)] {
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from(default_name)
}

/// Resolve the path used to invoke `tool`.
pub fn resolve(tool: Tool) -> PathBuf {
    let dir = exe_dir();
    resolve_in(tool.env_key(), tool.default_name(), dir.as_deref())
}

pub fn ffprobe_path() -> PathBuf {
    resolve(Tool::Ffprobe)
}

pub fn ffmpeg_path() -> PathBuf {
    resolve(Tool::Ffmpeg)
}

pub fn detector_path() -> PathBuf {
    resolve(Tool::Detector)
}
