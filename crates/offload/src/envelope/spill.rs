//! Out-of-band payload storage for oversized envelopes
//!
//! Payloads that exceed the transport's inline capacity are written through a
//! [`SpillStore`] and the envelope carries an opaque [`SpillToken`] instead of
//! bytes. The filesystem implementation writes atomically: a reader can never
//! observe a half-written spill file.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Spill-related errors
#[derive(Debug, Error)]
pub enum SpillError {
    /// Filesystem failure while writing or reading a spill file
    #[error("spill i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Token does not resolve to stored bytes
    #[error("spill token not found: {0}")]
    Missing(String),
}

/// Opaque reference to an out-of-band payload.
///
/// For the filesystem store this is the spill file path; for the in-memory
/// store it is a numeric key. Consumers must not interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpillToken(String);

impl SpillToken {
    pub fn new(token: impl Into<String>) -> Self {
        SpillToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Capability interface for out-of-band payload storage.
///
/// One size threshold in the codec decides between inline bytes and a spill;
/// implementations only store, load, and release.
pub trait SpillStore: Send + Sync {
    /// Store `bytes` and return a token that resolves to them
    fn write(&self, bytes: &[u8]) -> Result<SpillToken, SpillError>;

    /// Load the bytes behind `token`, leaving them in place
    fn read(&self, token: &SpillToken) -> Result<Vec<u8>, SpillError>;

    /// Release the storage behind `token`; disposing twice is not an error
    fn dispose(&self, token: &SpillToken) -> Result<(), SpillError>;
}

/// Filesystem-backed spill store.
///
/// Writes go to a temp file in the target directory and are renamed into
/// place once fully flushed, so concurrent readers see either nothing or the
/// complete payload.
pub struct TempFileSpillStore {
    dir: PathBuf,
}

impl TempFileSpillStore {
    /// Create a store writing into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory spill files are written to
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl Default for TempFileSpillStore {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl SpillStore for TempFileSpillStore {
    fn write(&self, bytes: &[u8]) -> Result<SpillToken, SpillError> {
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        // Rename into place; the in-progress file is never visible under the
        // final name.
        let final_path = file.path().with_extension("spill");
        file.persist(&final_path).map_err(|e| e.error)?;
        Ok(SpillToken::new(final_path.to_string_lossy()))
    }

    fn read(&self, token: &SpillToken) -> Result<Vec<u8>, SpillError> {
        match std::fs::read(token.as_str()) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SpillError::Missing(token.as_str().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispose(&self, token: &SpillToken) -> Result<(), SpillError> {
        match std::fs::remove_file(token.as_str()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory spill store for tests.
///
/// Same token semantics as [`TempFileSpillStore`] without touching the
/// filesystem.
#[derive(Default)]
pub struct MemorySpillStore {
    entries: Mutex<HashMap<u64, Vec<u8>>>,
    next_key: AtomicU64,
}

impl MemorySpillStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live spill entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SpillStore for MemorySpillStore {
    fn write(&self, bytes: &[u8]) -> Result<SpillToken, SpillError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(key, bytes.to_vec());
        Ok(SpillToken::new(key.to_string()))
    }

    fn read(&self, token: &SpillToken) -> Result<Vec<u8>, SpillError> {
        let key: u64 = token
            .as_str()
            .parse()
            .map_err(|_| SpillError::Missing(token.as_str().to_string()))?;
        self.entries
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| SpillError::Missing(token.as_str().to_string()))
    }

    fn dispose(&self, token: &SpillToken) -> Result<(), SpillError> {
        if let Ok(key) = token.as_str().parse::<u64>() {
            self.entries.lock().remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemorySpillStore::new();
        let token = store.write(b"payload").expect("write");
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(&token).expect("read"), b"payload");

        store.dispose(&token).expect("dispose");
        assert!(store.is_empty());
        assert!(matches!(store.read(&token), Err(SpillError::Missing(_))));
    }

    #[test]
    fn test_memory_store_dispose_is_idempotent() {
        let store = MemorySpillStore::new();
        let token = store.write(b"x").expect("write");
        store.dispose(&token).expect("first dispose");
        store.dispose(&token).expect("second dispose");
    }

    #[test]
    fn test_temp_file_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TempFileSpillStore::new(dir.path());

        let payload = vec![0xabu8; 64 * 1024];
        let token = store.write(&payload).expect("write");
        assert!(std::path::Path::new(token.as_str()).exists());
        assert_eq!(store.read(&token).expect("read"), payload);

        store.dispose(&token).expect("dispose");
        assert!(!std::path::Path::new(token.as_str()).exists());
        // second dispose is fine
        store.dispose(&token).expect("dispose again");
    }

    #[test]
    fn test_temp_file_store_missing_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TempFileSpillStore::new(dir.path());
        let token = SpillToken::new(dir.path().join("absent.spill").to_string_lossy());
        assert!(matches!(store.read(&token), Err(SpillError::Missing(_))));
    }
}
