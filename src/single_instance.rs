use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};
use crate::session::store::sanitize_key;

const FRESH_LOCK_WINDOW: Duration = Duration::from_secs(10);

/// Per-account run lock. Only one process may publish for an account at a
/// time since they share the persisted session. Removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock for `account`. Creation is atomic, so of two runs
    /// starting together exactly one wins. A lock left by a dead process is
    /// replaced once.
    pub fn acquire(dir: &Path, account: &str) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.lock", sanitize_key(account)));

        for _ in 0..2 {
            if create_lock_file(&path)? {
                log::info!("Created lock file with PID: {}", std::process::id());
                return Ok(Self { path });
            }

            match holder_of(&path) {
                Holder::Alive(pid) => {
                    log::warn!("Account {} is locked by running process {}", account, pid);
                    return Err(AppError::InstanceLocked {
                        account: account.to_string(),
                        pid,
                    });
                }
                Holder::Stale(pid) => log::info!("Replacing stale lock left by PID {}", pid),
                Holder::Garbage => {
                    log::warn!("Replacing unreadable lock file {}", path.display())
                }
            }
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        // Another run replaced the same stale lock first.
        Err(AppError::InstanceLocked {
            account: account.to_string(),
            pid: read_pid(&path).unwrap_or(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove lock file: {}", e);
        } else {
            log::info!("Cleaned up lock file");
        }
    }
}

enum Holder {
    Alive(u32),
    Stale(u32),
    Garbage,
}

/// Returns false when the file already exists.
fn create_lock_file(path: &Path) -> AppResult<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", std::process::id())?;
            file.sync_all()?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn holder_of(path: &Path) -> Holder {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        // Removed by its owner in the meantime
        Err(_) => return Holder::Garbage,
    };

    if let Ok(pid) = contents.trim().parse::<u32>() {
        return if process_alive(pid) {
            Holder::Alive(pid)
        } else {
            Holder::Stale(pid)
        };
    }

    // An empty file is a lock whose owner has not written its PID yet
    if contents.trim().is_empty() && recently_modified(path) {
        return Holder::Alive(0);
    }
    Holder::Garbage
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|at| SystemTime::now().duration_since(at).ok())
        .is_some_and(|age| age < FRESH_LOCK_WINDOW)
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

/// Route Ctrl+C into `token`. A second Ctrl+C exits immediately.
pub fn register_cancel_handler(token: CancellationToken) -> AppResult<()> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            log::warn!("Received second Ctrl+C, exiting");
            std::process::exit(130);
        }
        log::info!("Received Ctrl+C, cancelling after the current step...");
        token.cancel();
    })
    .map_err(|e| AppError::Internal(format!("Error setting Ctrl-C handler: {}", e)))
}
