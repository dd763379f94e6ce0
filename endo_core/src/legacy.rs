//! The legacy flat string key-value store.
//!
//! Before the versioned database existed, settings, entries and the cipher
//! bundle were kept as three JSON strings under fixed keys in a simple
//! string store. The migration reads them once and then removes them.

use crate::{Error, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Key holding the legacy plaintext entry array
pub const LEGACY_ENTRIES_KEY: &str = "endo_mini_v1_data";
/// Key holding the legacy settings object
pub const LEGACY_SETTINGS_KEY: &str = "endo_mini_v1_settings";
/// Key holding the legacy cipher bundle
pub const LEGACY_BUNDLE_KEY: &str = "endo_mini_v1_cipher";

/// A simple string-to-string store
pub trait LegacyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// Legacy store kept as a single JSON object file
#[derive(Clone, Debug)]
pub struct JsonFileLegacyStore {
    path: PathBuf,
}

impl JsonFileLegacyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_items(&self) -> Result<BTreeMap<String, String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut contents = String::new();
        std::io::BufReader::new(&file).read_to_string(&mut contents)?;
        file.unlock()?;

        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Read, modify and rewrite the file under an exclusive lock
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "legacy store path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path.with_extension("lock"))?;
        lock_file.lock_exclusive()?;

        let mut items = self.read_items()?;
        f(&mut items);

        if items.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
        } else {
            let temp = NamedTempFile::new_in(parent)?;
            {
                let mut writer = std::io::BufWriter::new(temp.as_file());
                writer.write_all(serde_json::to_string(&items)?.as_bytes())?;
                writer.flush()?;
            }
            temp.as_file().sync_all()?;
            temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        }

        // The lock file stays so every writer locks the same inode
        lock_file.unlock()?;
        Ok(())
    }
}

impl LegacyStore for JsonFileLegacyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_items()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.update(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.update(|items| {
            items.remove(key);
        })
    }
}

/// In-memory legacy store
#[derive(Debug, Default)]
pub struct MemoryLegacyStore {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryLegacyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        crate::engine::lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LegacyStore for MemoryLegacyStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(crate::engine::lock(&self.items).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        crate::engine::lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        crate::engine::lock(&self.items).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileLegacyStore::new(temp_dir.path().join("legacy/localstorage.json"));

        assert_eq!(store.get_item(LEGACY_SETTINGS_KEY).unwrap(), None);
        store.set_item(LEGACY_SETTINGS_KEY, r#"{"quickMode":false}"#).unwrap();
        store.set_item(LEGACY_ENTRIES_KEY, "[]").unwrap();
        assert_eq!(
            store.get_item(LEGACY_SETTINGS_KEY).unwrap().as_deref(),
            Some(r#"{"quickMode":false}"#)
        );

        store.remove_item(LEGACY_SETTINGS_KEY).unwrap();
        assert_eq!(store.get_item(LEGACY_SETTINGS_KEY).unwrap(), None);
        assert!(store.path().exists());

        // Removing the last key removes the file
        store.remove_item(LEGACY_ENTRIES_KEY).unwrap();
        assert!(!store.path().exists());
        assert!(store.path().with_extension("lock").exists());
    }

    #[test]
    fn test_concurrent_writers_keep_every_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("localstorage.json");

        std::thread::scope(|scope| {
            for i in 0..8 {
                let path = path.clone();
                scope.spawn(move || {
                    let store = JsonFileLegacyStore::new(path);
                    store.set_item(&format!("key{}", i), "v").unwrap();
                    store.remove_item(&format!("key{}", i)).unwrap();
                    store.set_item(&format!("kept{}", i), "v").unwrap();
                });
            }
        });

        let store = JsonFileLegacyStore::new(&path);
        for i in 0..8 {
            assert_eq!(
                store.get_item(&format!("kept{}", i)).unwrap().as_deref(),
                Some("v")
            );
            assert_eq!(store.get_item(&format!("key{}", i)).unwrap(), None);
        }
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("localstorage.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileLegacyStore::new(&path);
        assert!(store.get_item(LEGACY_ENTRIES_KEY).is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryLegacyStore::new();
        store.set_item("a", "1").unwrap();
        assert_eq!(store.len(), 1);
        store.remove_item("a").unwrap();
        assert!(store.is_empty());
    }
}
