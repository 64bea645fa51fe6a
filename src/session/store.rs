//! Persisted session storage.
//!
//! The store never judges whether a blob is still accepted remotely; that is
//! only discovered by the chain's verification call.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use super::SessionBlob;
use crate::errors::AppResult;

/// Minimal keyed byte storage the session store sits on.
pub trait ByteStore: Send + Sync {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()>;
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// One file per key under a directory.
pub struct FileByteStore {
    dir: PathBuf,
}

impl FileByteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.session", sanitize_key(key)))
    }
}

impl ByteStore for FileByteStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        // Write then rename so a crash never leaves a half-written session.
        let path = self.path_for(key);
        let tmp = path.with_extension("session.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

pub(crate) fn sanitize_key(key: &str) -> String {
    static UNSAFE_CHARS: OnceLock<Regex> = OnceLock::new();
    let unsafe_chars =
        UNSAFE_CHARS.get_or_init(|| Regex::new(r#"[^A-Za-z0-9._-]"#).expect("static pattern"));
    let cleaned = unsafe_chars.replace_all(key.trim(), "_").to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "default".to_string()
    } else {
        cleaned
    }
}

/// In-process store, mainly for tests and dry runs.
#[derive(Default)]
pub struct MemoryByteStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    removals: AtomicUsize,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: &str, bytes: &[u8]) -> Self {
        let store = Self::default();
        if let Ok(mut entries) = store.entries.lock() {
            entries.insert(key.to_string(), bytes.to_vec());
        }
        store
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "memory store lock poisoned")
}

impl ByteStore for MemoryByteStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Session persistence for a single account.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn ByteStore>,
    account: String,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn ByteStore>, account: &str) -> Self {
        Self {
            backend,
            account: account.to_string(),
        }
    }

    /// Unreadable or empty state is reported as absent.
    pub fn load(&self) -> Option<SessionBlob> {
        match self.backend.read(&self.account) {
            Ok(Some(bytes)) if !bytes.is_empty() => Some(SessionBlob::new(bytes)),
            Ok(Some(_)) => {
                log::warn!("Persisted session for {} is empty, ignoring", self.account);
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!(
                    "Failed to read persisted session for {} (treating as absent): {}",
                    self.account,
                    e
                );
                None
            }
        }
    }

    pub fn save(&self, blob: &SessionBlob) -> AppResult<()> {
        self.backend.write(&self.account, blob.as_bytes())?;
        log::info!("Session saved for {}", self.account);
        Ok(())
    }

    pub fn invalidate(&self) {
        match self.backend.remove(&self.account) {
            Ok(()) => log::info!("Cleared persisted session for {}", self.account),
            Err(e) => log::warn!(
                "Failed to clear persisted session for {} (non-critical): {}",
                self.account,
                e
            ),
        }
    }
}
