//! Per-collection ingestion checkpoints.
//!
//! A checkpoint is the last source position whose chunk was durably written to
//! the index. Stores are injected into the ingestor through [`CheckpointStore`];
//! commits go through [`CheckpointStore::compare_and_swap`] so two workers
//! sharing a store cannot silently overwrite each other's progress.
//!
//! [`FileCheckpointStore`] serializes read-modify-write cycles with an
//! exclusive `flock` on a sibling `<file>.lock`, so separate instances and
//! separate processes pointed at the same file see each other's commits.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use tracing::{debug, warn};

use crate::errors::CheckpointError;

/// Persistent `collection -> last committed position` map.
pub trait CheckpointStore: Send + Sync {
    /// Last committed position, or 0 if absent. Corrupt data reads as 0.
    fn read(&self, collection: &str) -> Result<u64, CheckpointError>;

    /// Unconditionally sets the position of `collection`, keeping other entries.
    fn write(&self, collection: &str, position: u64) -> Result<(), CheckpointError>;

    /// Sets `collection` to `new` only if it currently equals `expected`.
    ///
    /// Returns `Ok(false)` without writing when the stored value differs.
    fn compare_and_swap(
        &self,
        collection: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, CheckpointError>;
}

type Document = BTreeMap<String, u64>;

/// Checkpoints stored as one JSON object in a file, rewritten atomically.
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole document; missing or corrupt files load as empty.
    fn load(&self) -> Document {
        let data = match fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Document::new(),
            Err(e) => {
                warn!("Checkpoint file {:?} unreadable, ignoring: {e}", self.path);
                return Document::new();
            }
        };
        match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k, n)))
                .collect(),
            Ok(_) | Err(_) => {
                warn!("Checkpoint file {:?} is corrupt, treating as empty", self.path);
                Document::new()
            }
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Writes the document to a uniquely named temp file in the same
    /// directory, then renames it over the target.
    fn persist(&self, doc: &Document) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(doc)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Runs `f` on the current document while holding both the in-process
    /// mutex and the file lock.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Document) -> Option<T>,
    ) -> Result<Option<T>, CheckpointError> {
        let _guard = self.lock.lock().map_err(|_| CheckpointError::Poisoned)?;
        let _file_lock = FileLock::acquire(&self.lock_path())?;
        let mut doc = self.load();
        let out = f(&mut doc);
        if out.is_some() {
            self.persist(&doc)?;
        }
        Ok(out)
    }
}

/// Exclusive advisory lock held until drop (closing the descriptor releases it).
struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            loop {
                // SAFETY: the descriptor belongs to `file`, which outlives the call.
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if rc == 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }

        Ok(Self { _file: file })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn read(&self, collection: &str) -> Result<u64, CheckpointError> {
        let _guard = self.lock.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(self.load().get(collection).copied().unwrap_or(0))
    }

    fn write(&self, collection: &str, position: u64) -> Result<(), CheckpointError> {
        self.update(|doc| {
            doc.insert(collection.to_string(), position);
            Some(())
        })?;
        debug!("Checkpoint '{collection}' -> {position}");
        Ok(())
    }

    fn compare_and_swap(
        &self,
        collection: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, CheckpointError> {
        let swapped = self
            .update(|doc| {
                let current = doc.get(collection).copied().unwrap_or(0);
                (current == expected).then(|| {
                    doc.insert(collection.to_string(), new);
                })
            })?
            .is_some();
        if swapped {
            debug!("Checkpoint '{collection}' {expected} -> {new}");
        }
        Ok(swapped)
    }
}

/// In-memory checkpoints, mainly for tests and one-shot runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<Document>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self, collection: &str) -> Result<u64, CheckpointError> {
        let doc = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(doc.get(collection).copied().unwrap_or(0))
    }

    fn write(&self, collection: &str, position: u64) -> Result<(), CheckpointError> {
        let mut doc = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        doc.insert(collection.to_string(), position);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        collection: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool, CheckpointError> {
        let mut doc = self.inner.lock().map_err(|_| CheckpointError::Poisoned)?;
        let current = doc.get(collection).copied().unwrap_or(0);
        if current != expected {
            return Ok(false);
        }
        doc.insert(collection.to_string(), new);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn missing_file_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"));
        assert_eq!(store.read("tweets").unwrap(), 0);
    }

    #[test]
    fn write_keeps_other_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let store = FileCheckpointStore::new(&path);
        store.write("a", 10).unwrap();
        store.write("b", 3).unwrap();
        store.write("a", 12).unwrap();

        assert_eq!(store.read("a").unwrap(), 12);
        assert_eq!(store.read("b").unwrap(), 3);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"a": 12, "b": 3}));
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["cp.json", "cp.json.lock"]);
    }

    #[test]
    fn corrupt_file_reads_zero_and_is_replaced_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.read("a").unwrap(), 0);

        store.write("a", 5).unwrap();
        assert_eq!(store.read("a").unwrap(), 5);
    }

    #[test]
    fn non_integer_entry_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, r#"{"a": "seven", "b": 4}"#).unwrap();
        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.read("a").unwrap(), 0);
        assert_eq!(store.read("b").unwrap(), 4);
    }

    #[test]
    fn compare_and_swap_rejects_stale_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"));
        assert!(store.compare_and_swap("a", 0, 500).unwrap());
        assert!(!store.compare_and_swap("a", 0, 1000).unwrap());
        assert_eq!(store.read("a").unwrap(), 500);
        assert!(store.compare_and_swap("a", 500, 1000).unwrap());
        assert_eq!(store.read("a").unwrap(), 1000);
    }

    #[test]
    fn concurrent_cas_never_loses_updates() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut wins = 0u64;
                    for _ in 0..100 {
                        loop {
                            let cur = store.read("c").unwrap();
                            if store.compare_and_swap("c", cur, cur + 1).unwrap() {
                                wins += 1;
                                break;
                            }
                        }
                    }
                    wins
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 800);
        assert_eq!(store.read("c").unwrap(), 800);
    }

    #[test]
    fn separate_instances_on_one_file_keep_both_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let store = FileCheckpointStore::new(&path);
                std::thread::spawn(move || {
                    for pos in 0..300u64 {
                        assert!(store.compare_and_swap(name, pos, pos + 1).unwrap());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.read("a").unwrap(), 300);
        assert_eq!(store.read("b").unwrap(), 300);
    }

    #[test]
    fn separate_instances_serialize_cas_on_one_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = FileCheckpointStore::new(&path);
                std::thread::spawn(move || {
                    let mut wins = 0u64;
                    for _ in 0..25 {
                        loop {
                            let cur = store.read("c").unwrap();
                            if store.compare_and_swap("c", cur, cur + 1).unwrap() {
                                wins += 1;
                                break;
                            }
                        }
                    }
                    wins
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 200);
        assert_eq!(FileCheckpointStore::new(&path).read("c").unwrap(), 200);
    }
}
