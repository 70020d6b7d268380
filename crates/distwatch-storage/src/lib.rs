//! Atomic JSON persistence, repositories and HTTP fetch utilities for distwatch.

mod http;
mod repository;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use http::{
    parse_retry_after, transient_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetrySchedule,
};
pub use repository::{
    DatasetRepository, JsonRepository, MarkerRepository, MonitoringRepository,
    NotificationRepository, TargetRegistry, TargetsFile, DATASET_DIR, DATASET_FILE_PREFIX,
    HISTORY_FILE, MARKER_FILE, QUEUE_FILE, TARGETS_FILE,
};

pub const CRATE_NAME: &str = "distwatch-storage";

/// Temp files older than this are treated as leftovers of a crashed writer.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt json in {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File store rooted at a data directory. Writes are serialized per path and land via
/// temp-file rename so readers never observe a half-written file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically replace the file at `relative`. A failed write is retried once.
    pub async fn write_bytes(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let path = self.path(relative);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;
        write_with_retry(&path, bytes).await?;
        Ok(path)
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
    ) -> Result<PathBuf, StoreError> {
        let relative = relative.as_ref();
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
            what: relative.display().to_string(),
            source,
        })?;
        self.write_bytes(relative, &bytes).await
    }

    /// Write a file that must not exist yet. Returns `Ok(None)` if the path is taken.
    pub async fn create_json<T: Serialize + ?Sized>(
        &self,
        relative: impl AsRef<Path>,
        value: &T,
    ) -> Result<Option<PathBuf>, StoreError> {
        let relative = relative.as_ref();
        let path = self.path(relative);
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
            what: relative.display().to_string(),
            source,
        })?;
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;
        if fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?
        {
            return Ok(None);
        }
        write_with_retry(&path, &bytes).await?;
        Ok(Some(path))
    }

    pub async fn read_bytes(&self, relative: impl AsRef<Path>) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path(relative);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        relative: impl AsRef<Path>,
    ) -> Result<Option<T>, StoreError> {
        let relative = relative.as_ref();
        match self.read_bytes(relative).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    path: self.path(relative),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Read-modify-write under the path's write lock.
    pub async fn update_json<T, F>(&self, relative: impl AsRef<Path>, f: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let relative = relative.as_ref();
        let path = self.path(relative);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        let mut value: T = self.read_json(relative).await?.unwrap_or_default();
        f(&mut value);
        let bytes = serde_json::to_vec_pretty(&value).map_err(|source| StoreError::Serialize {
            what: relative.display().to_string(),
            source,
        })?;
        write_with_retry(&path, &bytes).await?;
        Ok(value)
    }

    /// Files directly under `relative_dir` whose names start with `prefix` and end with
    /// `suffix`, sorted by file name.
    pub async fn list_files(
        &self,
        relative_dir: impl AsRef<Path>,
        prefix: &str,
        suffix: &str,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.path(relative_dir);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && name.ends_with(suffix) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Delete `.tmp` leftovers older than an hour under `relative_dir`.
    pub async fn remove_stale_temp_files(&self, relative_dir: impl AsRef<Path>) -> Result<usize, StoreError> {
        let candidates = self.list_files(relative_dir, ".", ".tmp").await?;
        let now = SystemTime::now();
        let mut removed = 0usize;
        for path in candidates {
            let modified = fs::metadata(&path)
                .await
                .and_then(|m| m.modified())
                .map_err(|e| StoreError::io(&path, e))?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= STALE_TEMP_AGE {
                self.remove(&path).await?;
                debug!(path = %path.display(), "removed stale temp file");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn write_with_retry(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    match write_atomic(path, bytes).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(path = %path.display(), error = %first, "atomic write failed; retrying once");
            write_atomic(path, bytes)
                .await
                .map_err(|e| StoreError::io(path, e))
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}
