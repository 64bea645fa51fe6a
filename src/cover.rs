use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const COVER_FILTER: &str = "scale=1080:1920:force_original_aspect_ratio=decrease,\
pad=1080:1920:(ow-iw)/2:(oh-ih)/2";

/// Grab a portrait cover frame one second into `video`.
///
/// Returns `None` on any failure (ffmpeg missing, non-zero exit, timeout);
/// the remote then picks its own cover.
pub async fn extract_cover(video: &Path, out_dir: &Path, limit: Duration) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(out_dir).await {
        log::warn!("Cannot create cover directory {}: {}", out_dir.display(), e);
        return None;
    }

    let output = cover_path_for(video, out_dir);
    let mut command = Command::new("ffmpeg");
    command
        .arg("-y")
        .args(["-ss", "1"])
        .arg("-i")
        .arg(video)
        .args(["-frames:v", "1", "-vf", COVER_FILTER, "-q:v", "2"])
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    log::info!("Extracting cover for {}", video.display());

    let result = match timeout(limit, command.output()).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Cover extraction timed out after {:?}", limit);
            return None;
        }
    };

    match result {
        Ok(out) if out.status.success() && output.exists() => {
            log::info!("Cover written to {}", output.display());
            Some(output)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            log::warn!("ffmpeg exited with {}: {}", out.status, tail);
            None
        }
        Err(e) => {
            log::warn!("Could not run ffmpeg: {}", e);
            None
        }
    }
}

/// `<out_dir>/<video stem>_cover.jpg`
pub fn cover_path_for(video: &Path, out_dir: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "clip".to_string());
    out_dir.join(format!("{}_cover.jpg", stem))
}

pub async fn remove_cover(cover: &Path) {
    if let Err(e) = tokio::fs::remove_file(cover).await {
        log::debug!("Cover cleanup skipped for {}: {}", cover.display(), e);
    }
}
