pub mod ledger;

pub use ledger::PieceLedger;

use fs2::FileExt;
use piecemeal_core::{DropDocument, DOCUMENT_SCHEMA_VERSION};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timed out waiting for store lock {}", .0.display())]
    LockTimeout(PathBuf),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
}

enum Backend {
    File { path: PathBuf, lock_path: PathBuf },
    Memory,
}

/// Repository over the single persisted document.
///
/// Reads see the last committed snapshot. Mutations run against a working copy that is
/// written to disk (temp file + rename) before it replaces the snapshot, so a caller
/// that gets `Ok` back can rely on the change surviving a crash. When the backing file
/// is shared with other processes, each mutation re-reads it under an advisory lock.
pub struct DocumentStore {
    backend: Backend,
    state: Mutex<DropDocument>,
    lock_timeout: Duration,
}

impl DocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let document = match read_document(&path)? {
            Some(document) => document,
            None => DropDocument::new(),
        };
        let lock_path = lock_path_for(&path);
        debug!(
            event = "store_open",
            path = %path.display(),
            schema_version = document.schema_version
        );
        Ok(Self {
            backend: Backend::File { path, lock_path },
            state: Mutex::new(document),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn in_memory() -> Self {
        Self::from_document(DropDocument::new())
    }

    pub fn from_document(mut document: DropDocument) -> Self {
        document.upgrade();
        Self {
            backend: Backend::Memory,
            state: Mutex::new(document),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File { path, .. } => Some(path),
            Backend::Memory => None,
        }
    }

    pub fn get<R>(&self, read: impl FnOnce(&DropDocument) -> R) -> R {
        let state = self.lock_state();
        read(&state)
    }

    pub fn snapshot(&self) -> DropDocument {
        self.lock_state().clone()
    }

    /// Applies `apply` and persists the result. Nothing is committed if either the
    /// closure or the write fails; unchanged documents are not rewritten.
    pub fn mutate<R, E, F>(&self, apply: F) -> Result<R, E>
    where
        F: FnOnce(&mut DropDocument) -> Result<R, E>,
        E: From<StorageError>,
    {
        let mut state = self.lock_state();
        match &self.backend {
            Backend::Memory => {
                let mut working = state.clone();
                let result = apply(&mut working)?;
                *state = working;
                Ok(result)
            }
            Backend::File { path, lock_path } => {
                let _guard = AdvisoryStoreLock::acquire(lock_path, self.lock_timeout)?;
                let base = match read_document(path)? {
                    Some(document) => document,
                    None => state.clone(),
                };
                let mut working = base.clone();
                let result = apply(&mut working)?;
                if working != base {
                    write_atomic(path, &working)?;
                }
                *state = working;
                Ok(result)
            }
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let state = self.lock_state();
        if let Backend::File { path, lock_path } = &self.backend {
            let _guard = AdvisoryStoreLock::acquire(lock_path, self.lock_timeout)?;
            write_atomic(path, &state)?;
        }
        Ok(())
    }

    /// Picks up writes made by other processes since the last mutation.
    pub fn reload(&self) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        if let Backend::File { path, .. } = &self.backend {
            if let Some(document) = read_document(path)? {
                *state = document;
            }
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, DropDocument> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.lock", name.to_string_lossy())),
        None => path.with_extension("lock"),
    }
}

fn read_document(path: &Path) -> Result<Option<DropDocument>, StorageError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    let mut document: DropDocument = serde_json::from_str(&contents)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    if document.schema_version > DOCUMENT_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: document.schema_version,
            supported: DOCUMENT_SCHEMA_VERSION,
        });
    }
    document.upgrade();
    Ok(Some(document))
}

fn write_atomic(path: &Path, document: &DropDocument) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(document)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!(
            "{}.{}.tmp",
            name.to_string_lossy(),
            std::process::id()
        )),
        None => path.with_extension("tmp"),
    };

    let written = File::create(&temp_path).and_then(|mut file| {
        file.write_all(&payload)?;
        file.sync_all()
    });
    if let Err(err) = written.and_then(|_| fs::rename(&temp_path, path)) {
        let _ = fs::remove_file(&temp_path);
        return Err(err.into());
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

struct AdvisoryStoreLock {
    file: File,
}

impl AdvisoryStoreLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let started = Instant::now();
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { file });
            }
            if started.elapsed() >= timeout {
                return Err(StorageError::LockTimeout(path.to_path_buf()));
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }
}

impl Drop for AdvisoryStoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piecemeal_core::Puzzle;
    use tempfile::tempdir;

    fn demo() -> Puzzle {
        Puzzle {
            display_name: "Demo".to_string(),
            piece_count: 4,
            rows: 2,
            cols: 2,
            base_image_ref: "demo/base.png".to_string(),
            full_image_ref: "demo/full.png".to_string(),
            reward_ref: None,
            enabled: true,
        }
    }

    #[test]
    fn missing_file_starts_empty_and_is_created_on_first_write() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("drops.json");
        let store = DocumentStore::open(&path).expect("open store");
        assert!(store.get(|doc| doc.puzzles.is_empty()));
        assert!(!path.exists());

        store
            .mutate(|doc| {
                doc.puzzles.insert("demo".to_string(), demo());
                Ok::<_, StorageError>(())
            })
            .expect("mutate");

        assert!(path.exists());
        let reopened = DocumentStore::open(&path).expect("reopen");
        assert_eq!(reopened.get(|doc| doc.puzzles.len()), 1);
        assert_eq!(
            reopened.get(|doc| doc.schema_version),
            DOCUMENT_SCHEMA_VERSION
        );
    }

    #[test]
    fn failed_closure_commits_nothing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drops.json");
        let store = DocumentStore::open(&path).expect("open store");

        let result: Result<(), StorageError> = store.mutate(|doc| {
            doc.puzzles.insert("demo".to_string(), demo());
            Err(StorageError::Serialization("rejected".to_string()))
        });

        assert!(result.is_err());
        assert!(store.get(|doc| doc.puzzles.is_empty()));
        assert!(!path.exists());
    }

    #[test]
    fn failed_write_commits_nothing() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        let store = DocumentStore::open(blocker.join("drops.json")).expect("open store");
        fs::write(&blocker, b"file").expect("write blocker");

        let result = store.mutate(|doc| {
            doc.puzzles.insert("demo".to_string(), demo());
            Ok::<_, StorageError>(())
        });

        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(store.get(|doc| doc.puzzles.is_empty()));
    }

    #[test]
    fn mutation_sees_writes_from_another_handle() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drops.json");
        let first = DocumentStore::open(&path).expect("open first");
        let second = DocumentStore::open(&path).expect("open second");

        first
            .mutate(|doc| {
                doc.puzzles.insert("demo".to_string(), demo());
                Ok::<_, StorageError>(())
            })
            .expect("first write");
        second
            .mutate(|doc| {
                doc.puzzles.insert("other".to_string(), demo());
                Ok::<_, StorageError>(())
            })
            .expect("second write");

        first.reload().expect("reload");
        assert_eq!(first.get(|doc| doc.puzzles.len()), 2);
    }

    #[test]
    fn rejects_newer_schema() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drops.json");
        fs::write(&path, br#"{"schema_version": 99}"#).expect("write doc");

        match DocumentStore::open(&path) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, DOCUMENT_SCHEMA_VERSION);
            }
            other => panic!("expected schema error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("drops.json");
        let store = DocumentStore::open(&path).expect("open store");
        store
            .mutate(|doc| {
                doc.puzzles.insert("demo".to_string(), demo());
                Ok::<_, StorageError>(())
            })
            .expect("mutate");
        store.flush().expect("flush");

        let leftovers = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
