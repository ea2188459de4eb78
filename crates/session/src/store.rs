//! Raw key/value token storage
//!
//! `TokenStore` is the storage-agnostic contract: it persists and retrieves
//! opaque string fields and knows nothing about credentials or expiry. Two
//! backends are provided:
//!
//! - `MemoryTokenStore` for tests and hosts that keep the session in-process
//! - `FileTokenStore`, a JSON object on disk written atomically (temp file +
//!   rename) with 0600 permissions
//!
//! Reads are synchronous: they happen on the request path before dispatch,
//! and both backends answer from memory. Writes are batches applied as one
//! unit and are async, so a backend that persists does its I/O without
//! blocking the runtime.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Future returned by store writes.
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// One field mutation inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange<'a> {
    Set(&'a str, &'a str),
    Remove(&'a str),
}

/// Storage-agnostic key/value holder for credential fields.
pub trait TokenStore: Send + Sync {
    /// Read a raw field. `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read several fields as one snapshot; never mixes values from before
    /// and after a batch.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>>;

    /// Apply `changes` as one unit. Readers see all of them or none, and a
    /// persistent backend writes them in a single rewrite.
    fn apply<'a>(&'a self, changes: &'a [FieldChange<'a>]) -> StoreFuture<'a>;

    /// Write a raw field, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a> {
        Box::pin(async move { self.apply(&[FieldChange::Set(key, value)]).await })
    }

    /// Remove a raw field. Removing an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a> {
        Box::pin(async move { self.apply(&[FieldChange::Remove(key)]).await })
    }
}

/// Apply a batch to a field map; returns whether anything changed.
fn apply_changes(fields: &mut HashMap<String, String>, changes: &[FieldChange<'_>]) -> bool {
    let mut changed = false;
    for change in changes {
        match *change {
            FieldChange::Set(key, value) => {
                if fields.get(key).map(String::as_str) != Some(value) {
                    fields.insert(key.to_owned(), value.to_owned());
                    changed = true;
                }
            }
            FieldChange::Remove(key) => changed |= fields.remove(key).is_some(),
        }
    }
    changed
}

fn read_many(fields: &HashMap<String, String>, keys: &[&str]) -> Vec<Option<String>> {
    keys.iter().map(|key| fields.get(*key).cloned()).collect()
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    fields: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `fields`.
    pub fn with_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: Mutex::new(
                fields
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    fn fields(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.fields().get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        Ok(read_many(&self.fields(), keys))
    }

    fn apply<'a>(&'a self, changes: &'a [FieldChange<'a>]) -> StoreFuture<'a> {
        Box::pin(async move {
            apply_changes(&mut self.fields(), changes);
            Ok(())
        })
    }
}

/// File-backed token store.
///
/// The whole file is a flat JSON object of string fields. The field map is
/// updated in memory under a lock, then the file is rewritten atomically; a
/// crash mid-write never leaves a truncated credential file behind.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    fields: Mutex<HashMap<String, String>>,
    /// Serializes rewrites; each one persists the latest field map.
    persist: tokio::sync::Mutex<()>,
}

impl FileTokenStore {
    /// Open the store at `path`.
    ///
    /// A missing file is created as `{}` (no session yet). An existing file
    /// that is not a JSON object of strings is an error.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let fields = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading token file: {e}")))?;
            let fields: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing token file: {e}")))?;
            info!(path = %path.display(), fields = fields.len(), "loaded token store");
            fields
        } else {
            info!(path = %path.display(), "token file not found, starting with empty store");
            let fields = HashMap::new();
            write_atomic(&path, &fields).await?;
            fields
        };

        Ok(Self {
            path,
            fields: Mutex::new(fields),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fields(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.fields().get(key).cloned())
    }

    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        Ok(read_many(&self.fields(), keys))
    }

    fn apply<'a>(&'a self, changes: &'a [FieldChange<'a>]) -> StoreFuture<'a> {
        Box::pin(async move {
            let changed = apply_changes(&mut self.fields(), changes);
            if !changed {
                return Ok(());
            }
            debug!(changes = changes.len(), "stored token fields");

            let _persist = self.persist.lock().await;
            let snapshot = self.fields().clone();
            write_atomic(&self.path, &snapshot).await
        })
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the field map to `path` via a temp file in the same directory and a
/// rename over the target. The temp file is created 0600 on unix.
async fn write_atomic(path: &Path, fields: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(fields)
        .map_err(|e| Error::Parse(format!("serializing token fields: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(
        ".tokens.tmp.{}.{}",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    // Leftover from a crashed process that had the same pid
    let _ = tokio::fs::remove_file(&tmp_path).await;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp token file: {e}")))?;
    file.write_all(json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp token file: {e}")))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    debug!(path = %path.display(), "persisted token fields");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_set_get_remove() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.get("accessToken").unwrap(), None);

        store.set("accessToken", "at_1").await.unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("at_1"));

        store.set("accessToken", "at_2").await.unwrap();
        assert_eq!(store.get("accessToken").unwrap().as_deref(), Some("at_2"));

        store.remove("accessToken").await.unwrap();
        assert_eq!(store.get("accessToken").unwrap(), None);

        // Removing again is fine
        store.remove("accessToken").await.unwrap();
    }

    #[tokio::test]
    async fn batch_applies_every_change() {
        let store = MemoryTokenStore::with_fields([("tokenExpiresAt", "1000")]);

        store
            .apply(&[
                FieldChange::Set("accessToken", "at_1"),
                FieldChange::Remove("tokenExpiresAt"),
            ])
            .await
            .unwrap();

        assert_eq!(
            store.get_many(&["accessToken", "tokenExpiresAt"]).unwrap(),
            vec![Some("at_1".to_string()), None]
        );
    }

    #[tokio::test]
    async fn file_store_roundtrip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::open(path.clone()).await.unwrap();
        store
            .apply(&[
                FieldChange::Set("app:accessToken", "at_1"),
                FieldChange::Set("app:tokenExpiresAt", "1735500000000"),
            ])
            .await
            .unwrap();

        let reopened = FileTokenStore::open(path).await.unwrap();
        assert_eq!(
            reopened.get("app:accessToken").unwrap().as_deref(),
            Some("at_1")
        );
        assert_eq!(
            reopened.get("app:tokenExpiresAt").unwrap().as_deref(),
            Some("1735500000000")
        );
    }

    #[tokio::test]
    async fn file_store_cold_start_creates_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        assert!(!path.exists());
        let store = FileTokenStore::open(path.clone()).await.unwrap();
        assert_eq!(store.path(), path.as_path());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn file_store_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::open(path.clone()).await.unwrap();
        store.set("accessToken", "at_1").await.unwrap();
        store.remove("accessToken").await.unwrap();

        let reopened = FileTokenStore::open(path).await.unwrap();
        assert_eq!(reopened.get("accessToken").unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json {{{").unwrap();

        let err = FileTokenStore::open(path).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got: {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::open(path.clone()).await.unwrap();
        store.set("accessToken", "at_1").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn rewrites_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let store = FileTokenStore::open(path.clone()).await.unwrap();
        for i in 0..3 {
            store.set("accessToken", &format!("at_{i}")).await.unwrap();
        }

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["tokens.json".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = std::sync::Arc::new(FileTokenStore::open(path.clone()).await.unwrap());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.set(&format!("field-{i}"), &format!("v{i}")).await.unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10, "the last rewrite carries every field");
    }
}
