//! The persistent tier.
//!
//! A [`PersistentStore`] is a synchronous string-keyed store that survives process restarts.
//! [`Storage`] wraps an optional store and turns every failure into a logged "tier absent", so
//! that the caching layer never fails a request because of its persistent tier.

use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

/// Key used to check whether a store accepts reads and writes at all.
const PROBE_KEY: &str = "fetchcache-probe";

/// A synchronous key/value store that persists across process restarts.
pub trait PersistentStore: fmt::Debug + Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> io::Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> io::Result<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> io::Result<()>;

    /// Lists all keys currently held by the store.
    fn list_keys(&self) -> io::Result<Vec<String>>;
}

/// Failure-tolerant access to an optional [`PersistentStore`].
///
/// Whether the store works at all is probed once, on first use, by writing and removing a
/// probe key. An unavailable store is treated exactly like no store. Errors of individual
/// operations are logged and reported as misses.
#[derive(Clone, Debug, Default)]
pub struct Storage {
    store: Option<Arc<dyn PersistentStore>>,
    available: Arc<OnceLock<bool>>,
}

impl Storage {
    pub fn new(store: Option<Arc<dyn PersistentStore>>) -> Self {
        Self {
            store,
            available: Default::default(),
        }
    }

    /// A storage without a persistent tier.
    pub fn disabled() -> Self {
        Self::default()
    }

    fn store(&self) -> Option<&dyn PersistentStore> {
        let store = self.store.as_deref()?;
        let available = *self.available.get_or_init(|| match probe(store) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Persistent storage is unavailable"
                );
                false
            }
        });
        available.then_some(store)
    }

    /// Whether a working persistent tier is configured.
    pub fn is_available(&self) -> bool {
        self.store().is_some()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.store()?.get(key) {
            Ok(value) => value,
            Err(e) => {
                report_error(key, "Failed to read from persistent storage", &e);
                None
            }
        }
    }

    /// Writes a value, returning whether the write succeeded.
    pub fn set(&self, key: &str, value: &str) -> bool {
        let Some(store) = self.store() else {
            return false;
        };
        match store.set(key, value) {
            Ok(()) => true,
            Err(e) => {
                report_error(key, "Failed to write to persistent storage", &e);
                false
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let Some(store) = self.store() else {
            return;
        };
        if let Err(e) = store.remove(key) {
            report_error(key, "Failed to remove from persistent storage", &e);
        }
    }

    pub fn list_keys(&self) -> Vec<String> {
        let Some(store) = self.store() else {
            return vec![];
        };
        match store.list_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to list persistent storage"
                );
                vec![]
            }
        }
    }
}

fn probe(store: &dyn PersistentStore) -> io::Result<()> {
    store.set(PROBE_KEY, "1")?;
    store.get(PROBE_KEY)?;
    store.remove(PROBE_KEY)
}

fn report_error(key: &str, message: &str, error: &io::Error) {
    sentry::with_scope(
        |scope| scope.set_extra("key", key.into()),
        || tracing::error!(error = error as &dyn std::error::Error, "{message}"),
    );
}

/// A [`PersistentStore`] keeping one file per key below a root directory.
///
/// Files are named by the sha-256 hash of their key, and hold the key on their first line
/// followed by the value. Writes go through a temporary file that is atomically persisted.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the file holding `key`, formatted like `aa/bbccdd/eeff...`.
    fn path_for(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        self.root.join(path)
    }

    fn read_entry(path: &Path) -> io::Result<Option<(String, String)>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(contents
            .split_once('\n')
            .map(|(key, value)| (key.to_owned(), value.to_owned())))
    }

    fn collect_keys(dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_keys(&path, keys)?;
            } else if let Some((key, _)) = Self::read_entry(&path)? {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl PersistentStore for FsStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        let entry = Self::read_entry(&self.path_for(key))?;
        Ok(entry.and_then(|(stored_key, value)| (stored_key == key).then_some(value)))
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        if key.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "keys must not contain line breaks",
            ));
        }

        let path = self.path_for(key);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;
        fs::create_dir_all(parent)?;

        let mut temp_file = NamedTempFile::new_in(self.root.join(".tmp"))?;
        temp_file.write_all(key.as_bytes())?;
        temp_file.write_all(b"\n")?;
        temp_file.write_all(value.as_bytes())?;
        temp_file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn list_keys(&self) -> io::Result<Vec<String>> {
        let mut keys = vec![];
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_hidden = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'));
            if path.is_dir() && !is_hidden {
                Self::collect_keys(&path, &mut keys)?;
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// A [`PersistentStore`] held in memory.
///
/// Sharing one instance between several caches simulates a process restart. The store can be
/// switched into failure modes to exercise the degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail, like a disabled storage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Makes writes of anything but the probe key fail, like an exceeded quota.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::Relaxed);
    }

    /// Returns a copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries().clone()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> io::Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is disabled",
            ));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        self.check_available()?;
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.check_available()?;
        if key != PROBE_KEY && self.reject_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "storage quota exceeded",
            ));
        }
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.check_available()?;
        self.entries().remove(key);
        Ok(())
    }

    fn list_keys(&self) -> io::Result<Vec<String>> {
        self.check_available()?;
        Ok(self.entries().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store() {
        fetchcache_test::setup();
        let dir = fetchcache_test::tempdir();
        let store = FsStore::new(dir.path()).unwrap();

        assert_eq!(store.get("fetchcache:/a").unwrap(), None);

        store.set("fetchcache:/a", "first\nline").unwrap();
        store.set("fetchcache:/b", "{}").unwrap();
        store.set("fetchcache:/a", "second").unwrap();

        assert_eq!(store.get("fetchcache:/a").unwrap().as_deref(), Some("second"));
        assert_eq!(store.list_keys().unwrap(), ["fetchcache:/a", "fetchcache:/b"]);

        store.remove("fetchcache:/a").unwrap();
        store.remove("fetchcache:/missing").unwrap();
        assert_eq!(store.get("fetchcache:/a").unwrap(), None);
        assert_eq!(store.list_keys().unwrap(), ["fetchcache:/b"]);

        // a second store on the same directory sees the same data
        let reopened = FsStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get("fetchcache:/b").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_fs_store_rejects_line_breaks() {
        let dir = fetchcache_test::tempdir();
        let store = FsStore::new(dir.path()).unwrap();

        let err = store.set("a\nb", "value").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_fs_store_path_layout() {
        let dir = fetchcache_test::tempdir();
        let store = FsStore::new(dir.path()).unwrap();

        let path = store.path_for("fetchcache:/a");
        let relative = path.strip_prefix(dir.path()).unwrap().to_string_lossy();
        let segments: Vec<_> = relative.split(std::path::MAIN_SEPARATOR).collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), 2);
        assert_eq!(segments[1].len(), 6);
        assert_eq!(segments[2].len(), 56);
    }

    #[test]
    fn test_storage_unavailable() {
        fetchcache_test::setup();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let storage = Storage::new(Some(store.clone()));

        assert!(!storage.is_available());
        assert!(!storage.set("key", "value"));
        assert_eq!(storage.get("key"), None);
        assert!(storage.list_keys().is_empty());

        // availability is only probed once
        store.set_unavailable(false);
        assert!(!storage.is_available());
    }

    #[test]
    fn test_storage_rejected_writes() {
        fetchcache_test::setup();
        let store = Arc::new(MemoryStore::new());
        store.set_reject_writes(true);
        let storage = Storage::new(Some(store.clone()));

        assert!(storage.is_available());
        assert!(!storage.set("key", "value"));
        assert_eq!(storage.get("key"), None);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_storage_disabled() {
        let storage = Storage::disabled();
        assert!(!storage.is_available());
        assert!(!storage.set("key", "value"));
        storage.remove("key");
    }
}
