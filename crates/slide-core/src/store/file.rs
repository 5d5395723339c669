//! JSON file store with atomic writes and an exclusive process lock.
//!
//! The whole store is one JSON object. Writes go through:
//! 1. Serialize the full map to a uniquely named temp file
//! 2. fsync the temp file
//! 3. Keep a `.bak` copy of the previous file
//! 4. Atomically rename the temp file over the target
//!
//! A sibling `.lock` file is held with an exclusive `fs2` lock for as long as
//! the store is open, so two hosts never write the same store.

use super::KeyValueStore;
use crate::config::StoreConfig;
use crate::error::{Result, SlideError};
use async_trait::async_trait;
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
    _lock: File,
}

impl std::fmt::Debug for JsonFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileStore")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonFileStore {
    /// Open (or create) the store at `path`.
    ///
    /// Fails with [`SlideError::StoreLocked`] if another process holds it.
    /// A corrupt store file is logged and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| SlideError::Io {
                    message: format!("Failed to create directory {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let lock_path = path.with_extension(StoreConfig::LOCK_FILE_EXTENSION);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| SlideError::Io {
                message: format!("Failed to open lock file {}", lock_path.display()),
                path: Some(lock_path.clone()),
                source: Some(e),
            })?;
        lock.try_lock_exclusive()
            .map_err(|_| SlideError::StoreLocked { path: path.clone() })?;

        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Store {} is unreadable, starting empty: {}", path.display(), e);
                Map::new()
            }
        };
        info!("Opened store {} with {} keys", path.display(), entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            _lock: lock,
        })
    }

    /// Open the store at the platform default location.
    pub fn open_default() -> Result<Self> {
        let path = StoreConfig::default_store_path().ok_or_else(|| SlideError::Config {
            message: "No platform data directory available".to_string(),
        })?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, snapshot: Map<String, Value>) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &Value::Object(snapshot)))
            .await
            .map_err(|e| SlideError::Store {
                message: format!("Store write task failed: {}", e),
            })?
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        // The lock is held across the write so files land in mutation order.
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(entries.clone()).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.persist(entries.clone()).await?;
        Ok(true)
    }
}

fn read_entries(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let contents = fs::read_to_string(path).map_err(|e| SlideError::Io {
        message: format!("Failed to read {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;
    match serde_json::from_str::<Value>(&contents).map_err(|e| SlideError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })? {
        Value::Object(entries) => Ok(entries),
        other => Err(SlideError::Store {
            message: format!("Expected a JSON object in {}, found {}", path.display(), other),
        }),
    }
}

fn atomic_write_json(path: &Path, data: &Value) -> Result<()> {
    let temp_path = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

    let serialized = serde_json::to_string_pretty(data).map_err(|e| SlideError::Json {
        message: format!("Failed to serialize store: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| SlideError::Io {
                message: format!("Failed to create temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;

        file.write_all(serialized.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| SlideError::Io {
                message: format!("Failed to write temp file {}", temp_path.display()),
                path: Some(temp_path.clone()),
                source: Some(e),
            })?;
    }

    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        }
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        SlideError::Io {
            message: format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            path: Some(path.to_path_buf()),
            source: Some(e),
        }
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}
