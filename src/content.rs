use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::errors::{AppError, AppResult};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi"];

// Upper bound accepted by the remote for a single clip
const MAX_VIDEO_SIZE: u64 = 1024 * 1024 * 1024;

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Candidate videos directly inside `dir`, sorted by name. A missing
/// directory yields an empty list.
pub fn find_videos(dir: &Path) -> AppResult<Vec<PathBuf>> {
    if !dir.exists() {
        log::warn!("Content directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut videos = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_video_path(&path) {
            videos.push(path);
        }
    }
    videos.sort();

    log::debug!("Found {} candidate videos in {}", videos.len(), dir.display());
    Ok(videos)
}

pub fn pick_random(videos: &[PathBuf]) -> Option<PathBuf> {
    videos.choose(&mut rand::thread_rng()).cloned()
}

pub fn validate_video_file(path: &Path) -> AppResult<()> {
    let display = path.display().to_string();

    if !is_video_path(path) {
        return Err(AppError::invalid_file_type(&display));
    }

    if !path.exists() {
        return Err(AppError::file_not_found(&display));
    }

    let metadata = fs::metadata(path)?;
    if !metadata.is_file() {
        return Err(AppError::validation("video", "Path is not a file"));
    }
    if metadata.len() == 0 {
        return Err(AppError::validation("video", "Video file is empty"));
    }
    if metadata.len() > MAX_VIDEO_SIZE {
        return Err(AppError::file_too_large(&display));
    }

    Ok(())
}

/// Identity of a file's current contents: size plus modification time.
/// A new clip written under a reused name gets a different fingerprint.
pub fn fingerprint(path: &Path) -> AppResult<String> {
    let metadata = fs::metadata(path)?;
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}:{}", metadata.len(), modified))
}

/// Delete a published source file. Failure is logged, not raised: the clip
/// is already live.
pub fn remove_published(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            log::info!("Removed published file {}", path.display());
            true
        }
        Err(e) => {
            log::warn!("Failed to remove published file {}: {}", path.display(), e);
            false
        }
    }
}
