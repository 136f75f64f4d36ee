// Video file discovery under camera roots

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{PackError, Result};
use crate::metadata::is_video_file;

/// Markers recorders and sync clients put in a name while the file is
/// still being written (`clip.part.mp4`).
const PARTIAL_SUFFIXES: [&str; 4] = ["part", "partial", "tmp", "crdownload"];

/// Discover all video files under `source_path` (or the file itself).
///
/// Hidden entries and in-progress downloads are skipped. Unreadable
/// directory entries are logged and skipped.
pub fn discover_video_files(source_path: &Path) -> Result<Vec<PathBuf>> {
    if source_path.is_file() {
        return Ok(if is_candidate(source_path) {
            vec![source_path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    if !source_path.is_dir() {
        return Err(PackError::FileNotFound(source_path.display().to_string()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(source_path)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Skipping unreadable entry under {}: {}", source_path.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if entry.file_type().is_file() && is_candidate(path) {
            files.push(path.to_path_buf());
        }
    }

    // Sort by path for consistent ordering
    files.sort();

    Ok(files)
}

fn is_candidate(path: &Path) -> bool {
    is_video_file(path) && !is_hidden(path) && !is_partial(path)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn is_partial(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_lowercase(),
        None => return false,
    };
    PARTIAL_SUFFIXES
        .iter()
        .any(|suffix| name.contains(&format!(".{}.", suffix)))
}
