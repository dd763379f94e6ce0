//! Storage hosts backing the key-value engine.
//!
//! A host stores whole tables as ordered lists of JSON records and knows the
//! version each database was last upgraded to. Writing a table replaces it
//! atomically; the engine builds transactions on top of that.

use super::schema::{is_valid_name, Schema};
use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// A host-provided persistent object store
pub trait StorageHost: Send + Sync {
    /// Fail with `EngineUnavailable` when the host cannot persist anything
    fn ensure_available(&self) -> Result<()>;

    /// Establish a connection and report the stored version, if the database exists
    fn connect(&self, db: &str) -> Result<Option<u32>>;

    /// The stored version as it is right now
    fn current_version(&self, db: &str) -> Result<Option<u32>>;

    /// Create missing tables and record the schema version
    fn upgrade(&self, db: &str, schema: &Schema) -> Result<()>;

    fn read_table(&self, db: &str, table: &str) -> Result<Vec<Value>>;

    /// Atomically replace a table's records
    fn write_table(&self, db: &str, table: &str, rows: &[Value]) -> Result<()>;

    /// Delete the database entirely
    fn destroy(&self, db: &str) -> Result<()>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// File Host
// ============================================================================

/// Manifest stored alongside a database's table files
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    tables: Vec<String>,
}

/// File-backed host: one directory per database, one JSON file per table
///
/// Writes go through a temp file in the same directory that is synced and
/// renamed over the target. An advisory lock file serializes writers across
/// processes.
#[derive(Clone, Debug)]
pub struct FileHost {
    root: PathBuf,
}

impl FileHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn db_dir(&self, db: &str) -> Result<PathBuf> {
        if !is_valid_name(db) {
            return Err(Error::Schema(format!("invalid database name '{}'", db)));
        }
        Ok(self.root.join(db))
    }

    fn manifest_path(&self, db: &str) -> Result<PathBuf> {
        Ok(self.db_dir(db)?.join("manifest.json"))
    }

    fn table_path(&self, db: &str, table: &str) -> Result<PathBuf> {
        if !is_valid_name(table) {
            return Err(Error::UnknownTable(table.to_string()));
        }
        Ok(self.db_dir(db)?.join(format!("{}.json", table)))
    }

    /// Take the database's advisory lock; released when the file drops
    fn lock_db(&self, db: &str, exclusive: bool) -> Result<File> {
        let dir = self.db_dir(db)?;
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(".lock"))?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    fn read_manifest(&self, db: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(db)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "table path missing parent")
        })?;
        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            writer.write_all(bytes)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

impl StorageHost for FileHost {
    fn ensure_available(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| {
            Error::EngineUnavailable(format!("cannot use {:?}: {}", self.root, e))
        })?;
        if !self.root.is_dir() {
            return Err(Error::EngineUnavailable(format!(
                "{:?} is not a directory",
                self.root
            )));
        }
        Ok(())
    }

    fn connect(&self, db: &str) -> Result<Option<u32>> {
        self.current_version(db)
    }

    fn current_version(&self, db: &str) -> Result<Option<u32>> {
        if !self.db_dir(db)?.exists() {
            return Ok(None);
        }
        let _guard = self.lock_db(db, false)?;
        Ok(self.read_manifest(db)?.map(|m| m.version))
    }

    fn upgrade(&self, db: &str, schema: &Schema) -> Result<()> {
        let guard = self.lock_db(db, true)?;
        let mut manifest = self.read_manifest(db)?.unwrap_or(Manifest {
            version: 0,
            tables: Vec::new(),
        });

        for table in schema.tables() {
            if !manifest.tables.contains(&table.name) {
                let path = self.table_path(db, &table.name)?;
                if !path.exists() {
                    Self::write_atomic(&path, b"[]")?;
                }
                manifest.tables.push(table.name.clone());
                tracing::debug!("Created table '{}' in {}", table.name, db);
            }
        }
        manifest.version = schema.version;
        Self::write_atomic(&self.manifest_path(db)?, &serde_json::to_vec(&manifest)?)?;

        guard.unlock()?;
        Ok(())
    }

    fn read_table(&self, db: &str, table: &str) -> Result<Vec<Value>> {
        let path = self.table_path(db, table)?;
        let guard = self.lock_db(db, false)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        guard.unlock()?;

        Ok(serde_json::from_str(&contents)?)
    }

    fn write_table(&self, db: &str, table: &str, rows: &[Value]) -> Result<()> {
        let path = self.table_path(db, table)?;
        let guard = self.lock_db(db, true)?;
        Self::write_atomic(&path, &serde_json::to_vec(rows)?)?;
        guard.unlock()?;
        tracing::debug!("Wrote {} records to {}/{}", rows.len(), db, table);
        Ok(())
    }

    fn destroy(&self, db: &str) -> Result<()> {
        let dir = self.db_dir(db)?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            tracing::info!("Deleted database {:?}", dir);
        }
        Ok(())
    }
}

// ============================================================================
// Memory Host
// ============================================================================

#[derive(Debug, Default)]
struct MemoryDatabase {
    version: u32,
    tables: BTreeMap<String, Vec<Value>>,
}

/// Process-local host, mainly for tests
///
/// Besides storage it can simulate a host without persistence, failing
/// writes, and a competing writer bumping the version.
#[derive(Debug)]
pub struct MemoryHost {
    databases: Mutex<HashMap<String, MemoryDatabase>>,
    available: bool,
    fail_writes: AtomicBool,
    connections: AtomicUsize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            available: true,
            fail_writes: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
        }
    }

    /// A host without any persistent storage
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Make every subsequent table write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of connections established so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Simulate another writer upgrading the database
    pub fn bump_version(&self, db: &str, version: u32) {
        lock(&self.databases).entry(db.to_string()).or_default().version = version;
    }
}

impl StorageHost for MemoryHost {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::EngineUnavailable("in-memory host has no storage".into()))
        }
    }

    fn connect(&self, db: &str) -> Result<Option<u32>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.current_version(db)
    }

    fn current_version(&self, db: &str) -> Result<Option<u32>> {
        Ok(lock(&self.databases).get(db).map(|d| d.version))
    }

    fn upgrade(&self, db: &str, schema: &Schema) -> Result<()> {
        let mut databases = lock(&self.databases);
        let database = databases.entry(db.to_string()).or_default();
        for table in schema.tables() {
            database.tables.entry(table.name.clone()).or_default();
        }
        database.version = schema.version;
        Ok(())
    }

    fn read_table(&self, db: &str, table: &str) -> Result<Vec<Value>> {
        Ok(lock(&self.databases)
            .get(db)
            .and_then(|d| d.tables.get(table))
            .cloned()
            .unwrap_or_default())
    }

    fn write_table(&self, db: &str, table: &str, rows: &[Value]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        lock(&self.databases)
            .entry(db.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), rows.to_vec());
        Ok(())
    }

    fn destroy(&self, db: &str) -> Result<()> {
        lock(&self.databases).remove(db);
        Ok(())
    }
}
