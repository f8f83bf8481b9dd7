//! Keyed record storage shared by the config, ignore-list and credential stores.
//! Each record is one JSON document. Writes go through a temp file + rename so a
//! reader never observes a half-written record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Minimal record store: raw text in, raw text out. Parsing and the corruption
/// policy live in [`load_or_init`] so they can be exercised without a filesystem.
pub trait Repository: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn save(&self, key: &str, contents: &str) -> Result<(), StoreError>;

    /// Move the record out of the way under a derived name. Returns that name,
    /// or `None` if there was nothing to move.
    fn quarantine(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// How a record came to be in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Loaded,
    Created,
    Quarantined { backup: String },
}

/// Load `key`, or write `init()` if it is missing. A record that fails to parse
/// is quarantined and replaced by a freshly written `init()`.
pub fn load_or_init<T, F>(
    repo: &dyn Repository,
    key: &str,
    init: F,
) -> Result<(T, Recovery), StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> T,
{
    let raw = match repo.load(key)? {
        Some(raw) => raw,
        None => {
            let value = init();
            save_json(repo, key, &value)?;
            return Ok((value, Recovery::Created));
        }
    };

    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Ok((value, Recovery::Loaded)),
        Err(e) => {
            warn!(key, error = %e, "corrupt record, quarantining");
            let backup = repo.quarantine(key)?.unwrap_or_default();
            let value = init();
            save_json(repo, key, &value)?;
            info!(key, backup = %backup, "record replaced with defaults");
            Ok((value, Recovery::Quarantined { backup }))
        }
    }
}

pub fn save_json<T: Serialize>(repo: &dyn Repository, key: &str, value: &T) -> Result<(), StoreError> {
    let encoded = serde_json::to_string_pretty(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })?;
    repo.save(key, &encoded)
}

/// One `<key>.json` file per record under a root directory.
pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_key(key)))
    }
}

impl Repository for JsonFileRepository {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(key);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn save(&self, key: &str, contents: &str) -> Result<(), StoreError> {
        write_text_atomic(&self.record_path(key), contents)
    }

    fn quarantine(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let backup_name = format!("{}.json.corrupt-{}", sanitize_key(key), now_unix_ms());
        let backup_path = self.root.join(&backup_name);
        std::fs::rename(&path, &backup_path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Some(backup_name))
    }
}

/// In-process repository, used by tests and by dry runs without a storage directory.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<BTreeMap<String, String>>,
    quarantined: Mutex<Vec<(String, String)>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw record, bypassing serialization (e.g. to simulate corruption).
    pub fn insert_raw(&self, key: &str, contents: &str) {
        self.records.lock().insert(key.to_string(), contents.to_string());
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.records.lock().get(key).cloned()
    }

    /// (backup name, contents) of every quarantined record, oldest first.
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantined.lock().clone()
    }
}

impl Repository for MemoryRepository {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn save(&self, key: &str, contents: &str) -> Result<(), StoreError> {
        self.records.lock().insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn quarantine(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(contents) = self.records.lock().remove(key) else {
            return Ok(None);
        };
        let mut quarantined = self.quarantined.lock();
        let backup = format!("{key}.corrupt-{}", quarantined.len());
        quarantined.push((backup.clone(), contents));
        Ok(Some(backup))
    }
}

fn write_text_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir).map_err(|source| StoreError::Io {
        path: parent_dir.to_path_buf(),
        source,
    })?;

    let temp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("record"),
        std::process::id(),
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content).map_err(|source| StoreError::Io {
        path: temp_path.clone(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn now_unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
