use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::PersistentStore;
use crate::error::EngineError;

/// JSON-object file on disk, shared between processes.
///
/// Every operation takes an exclusive advisory lock on the file for the whole
/// read-modify-write, so concurrent writers never lose each other's keys.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_entries<R>(
        &self,
        modify: bool,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> R,
    ) -> Result<R, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let mut lock = fd_lock::RwLock::new(file);
        let mut guard = lock.write()?;

        let mut contents = String::new();
        guard.read_to_string(&mut contents)?;
        let mut entries: BTreeMap<String, String> = if contents.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Storage file is corrupted; starting empty");
                BTreeMap::new()
            })
        };

        let result = f(&mut entries);

        if modify {
            let serialized = serde_json::to_string_pretty(&entries)?;
            guard.set_len(0)?;
            guard.seek(SeekFrom::Start(0))?;
            guard.write_all(serialized.as_bytes())?;
            guard.flush()?;
        }
        Ok(result)
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        self.with_entries(false, |entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.with_entries(true, |entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<bool, EngineError> {
        self.with_entries(true, |entries| entries.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, EngineError> {
        self.with_entries(false, |entries| entries.keys().cloned().collect())
    }
}
