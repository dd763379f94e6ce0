//! Minimal transactional key-value engine.
//!
//! An [`Engine`] owns one versioned database on a [`StorageHost`]. Tables are
//! declared up front with a typed [`Schema`]; every table operation runs in
//! its own transaction that either commits completely or leaves the table
//! untouched.
//!
//! The connection is opened lazily and memoized: concurrent callers wait on
//! the same open instead of racing. When another writer upgrades the stored
//! database, the engine closes its connection and the next call reopens it.

mod host;
mod schema;

pub use host::{FileHost, MemoryHost, StorageHost};
pub use schema::{Key, Schema, TableSchema};
pub(crate) use host::lock;
pub(crate) use schema::is_valid_name;

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Callback run when another writer changes the database version
pub type VersionChangeHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Transaction access mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// An open connection to one database version
#[derive(Debug)]
struct Connection {
    version: u32,
    /// One gate per declared table; transactions on a table run one at a time
    gates: BTreeMap<String, Gate>,
}

#[derive(Debug, Default)]
struct Gate {
    lock: Mutex<()>,
    holder: Mutex<Option<ThreadId>>,
}

impl Gate {
    /// Wait for the table, failing instead of blocking on re-entry
    fn enter(&self, table: &str) -> Result<GateGuard<'_>> {
        let me = thread::current().id();
        if *lock(&self.holder) == Some(me) {
            return Err(Error::aborted(
                table,
                "nested transaction on the same table",
            ));
        }
        let held = lock(&self.lock);
        *lock(&self.holder) = Some(me);
        Ok(GateGuard { gate: self, _held: held })
    }
}

struct GateGuard<'g> {
    gate: &'g Gate,
    _held: MutexGuard<'g, ()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.holder) = None;
    }
}

/// Handle to a single versioned database
pub struct Engine {
    name: String,
    schema: Option<Schema>,
    host: Arc<dyn StorageHost>,
    connection: Mutex<Option<Arc<Connection>>>,
    handlers: Mutex<Vec<VersionChangeHandler>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Engine {
    /// Create an engine for the named database; nothing is opened yet
    pub fn new(name: impl Into<String>, host: Arc<dyn StorageHost>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            host,
            connection: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Declare the tables and version; must happen before the first open
    pub fn declare_schema(&mut self, schema: Schema) -> Result<()> {
        if self.is_open() {
            return Err(Error::Schema(
                "schema cannot change while the database is open".into(),
            ));
        }
        schema.validate()?;
        self.schema = Some(schema);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Open (or upgrade) the database if it is not open yet
    pub fn open(&self) -> Result<()> {
        self.connection().map(|_| ())
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = lock(&self.connection);
        if let Some(conn) = slot.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let schema = self.schema.as_ref().ok_or_else(|| {
            Error::Schema("schema must be declared before the database is opened".into())
        })?;
        self.host.ensure_available()?;

        match self.host.connect(&self.name)? {
            Some(stored) if stored > schema.version => {
                return Err(Error::VersionConflict {
                    stored,
                    declared: schema.version,
                });
            }
            Some(stored) if stored == schema.version => {}
            stored => {
                tracing::info!(
                    "Upgrading database {} from {:?} to version {}",
                    self.name,
                    stored,
                    schema.version
                );
                self.host.upgrade(&self.name, schema)?;
            }
        }

        let conn = Arc::new(Connection {
            version: schema.version,
            gates: schema
                .tables()
                .iter()
                .map(|t| (t.name.clone(), Gate::default()))
                .collect(),
        });
        *slot = Some(Arc::clone(&conn));
        tracing::debug!("Opened database {} at version {}", self.name, schema.version);
        Ok(conn)
    }

    /// Release the connection; the next operation reopens it
    pub fn close(&self) {
        if lock(&self.connection).take().is_some() {
            tracing::debug!("Closed database {}", self.name);
        }
    }

    /// Register an extra handler for version-change notifications
    pub fn on_version_change(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.handlers).push(Box::new(handler));
    }

    /// Another writer changed the database: run handlers and close
    pub fn notify_version_change(&self) {
        tracing::info!("Database {} changed version elsewhere, closing", self.name);
        for handler in lock(&self.handlers).iter() {
            handler(&self.name);
        }
        self.close();
    }

    /// Close the connection and delete the database
    pub fn destroy(&self) -> Result<()> {
        self.close();
        self.host.destroy(&self.name)
    }

    /// Typed handle to a declared table
    pub fn table<T>(&self, name: &str) -> Result<Table<'_, T>> {
        self.table_schema(name)?;
        Ok(Table {
            engine: self,
            name: name.to_string(),
            _marker: PhantomData,
        })
    }

    fn table_schema(&self, name: &str) -> Result<&TableSchema> {
        self.schema
            .as_ref()
            .and_then(|s| s.get(name))
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Run `f` inside one atomic transaction on `table`
    ///
    /// Changes are committed only if `f` returns `Ok` and the write reaches
    /// the host. Any failure rolls back and surfaces as `TransactionAborted`.
    pub fn transaction<R, F>(&self, table: &str, mode: TxMode, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        let table_schema = self.table_schema(table)?;
        let conn = self.connection()?;
        let gate = conn
            .gates
            .get(table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))?
            .enter(table)?;

        let rows = self
            .host
            .read_table(&self.name, table)
            .map_err(|e| Error::aborted(table, e.to_string()))?;
        let mut tx = Transaction::new(table_schema, mode, rows);

        let result = match f(&mut tx) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!("Rolled back transaction on {}: {}", table, e);
                return Err(match e {
                    aborted @ Error::TransactionAborted { .. } => aborted,
                    other => Error::aborted(table, other.to_string()),
                });
            }
        };

        if tx.dirty {
            let current = self
                .host
                .current_version(&self.name)
                .map_err(|e| Error::aborted(table, e.to_string()))?;
            if current != Some(conn.version) {
                drop(gate);
                self.notify_version_change();
                return Err(Error::aborted(
                    table,
                    "database version changed by another writer",
                ));
            }

            self.host
                .write_table(&self.name, table, &tx.rows())
                .map_err(|e| Error::aborted(table, e.to_string()))?;
        }

        Ok(result)
    }
}

/// Staged view of one table inside a transaction
pub struct Transaction<'s> {
    schema: &'s TableSchema,
    mode: TxMode,
    records: BTreeMap<Key, Value>,
    dirty: bool,
}

impl<'s> Transaction<'s> {
    fn new(schema: &'s TableSchema, mode: TxMode, rows: Vec<Value>) -> Self {
        let mut records = BTreeMap::new();
        for row in rows {
            match schema.key_of(&row) {
                Some(key) => {
                    records.insert(key, row);
                }
                None => tracing::warn!("Skipping keyless record in table {}", schema.name),
            }
        }
        Self {
            schema,
            mode,
            records,
            dirty: false,
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(Error::aborted(
                &self.schema.name,
                "write attempted in a read-only transaction",
            )),
        }
    }

    fn next_auto_key(&self) -> i64 {
        self.records
            .keys()
            .filter_map(|k| match k {
                Key::Int(n) => Some(*n),
                Key::Text(_) => None,
            })
            .max()
            .map_or(1, |n| n + 1)
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.records.get(key)
    }

    /// Insert or replace a record, returning its key
    pub fn put(&mut self, mut record: Value) -> Result<Key> {
        self.ensure_writable()?;
        let key = match self.schema.key_of(&record) {
            Some(key) => key,
            None if self.schema.auto_increment => {
                let key = Key::Int(self.next_auto_key());
                let obj = record.as_object_mut().ok_or_else(|| {
                    Error::aborted(&self.schema.name, "records must be JSON objects")
                })?;
                obj.insert(self.schema.key_path.clone(), key.to_value());
                key
            }
            None => {
                return Err(Error::aborted(
                    &self.schema.name,
                    format!("record has no key at '{}'", self.schema.key_path),
                ));
            }
        };
        self.records.insert(key.clone(), record);
        self.dirty = true;
        Ok(key)
    }

    pub fn delete(&mut self, key: &Key) -> Result<()> {
        self.ensure_writable()?;
        if self.records.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if !self.records.is_empty() {
            self.records.clear();
            self.dirty = true;
        }
        Ok(())
    }

    /// All records in key order
    pub fn to_array(&self) -> Vec<Value> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn rows(&self) -> Vec<Value> {
        self.to_array()
    }
}

/// Typed access to one table; each call is its own transaction
pub struct Table<'e, T> {
    engine: &'e Engine,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Table<'_, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<T>> {
        let key = key.into();
        let raw = self
            .engine
            .transaction(&self.name, TxMode::ReadOnly, |tx| Ok(tx.get(&key).cloned()))?;
        raw.map(serde_json::from_value).transpose().map_err(Error::from)
    }

    pub fn put(&self, item: &T) -> Result<Key> {
        let value = serde_json::to_value(item)?;
        self.engine
            .transaction(&self.name, TxMode::ReadWrite, |tx| tx.put(value))
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<()> {
        let key = key.into();
        self.engine
            .transaction(&self.name, TxMode::ReadWrite, |tx| tx.delete(&key))
    }

    /// Put every item in one transaction; an empty slice is a no-op
    pub fn bulk_put(&self, items: &[T]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let values = items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.engine.transaction(&self.name, TxMode::ReadWrite, |tx| {
            for value in values {
                tx.put(value)?;
            }
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.engine
            .transaction(&self.name, TxMode::ReadWrite, |tx| tx.clear())
    }

    pub fn to_array(&self) -> Result<Vec<T>> {
        let raw = self
            .engine
            .transaction(&self.name, TxMode::ReadOnly, |tx| Ok(tx.to_array()))?;
        raw.into_iter()
            .map(|v| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetaRecord;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schema() -> Schema {
        Schema::new(1)
            .table(TableSchema::keyed("entries", "date"))
            .table(TableSchema::keyed("meta", "key"))
            .table(TableSchema::auto_increment("log", "id"))
    }

    fn engine_on(host: Arc<MemoryHost>) -> Engine {
        let mut engine = Engine::new("diary", host);
        engine.declare_schema(schema()).unwrap();
        engine
    }

    #[test]
    fn test_open_requires_schema() {
        let engine = Engine::new("diary", Arc::new(MemoryHost::new()));
        assert!(matches!(engine.open(), Err(Error::Schema(_))));
    }

    #[test]
    fn test_open_fails_without_storage() {
        let mut engine = Engine::new("diary", Arc::new(MemoryHost::unavailable()));
        engine.declare_schema(schema()).unwrap();
        assert!(matches!(engine.open(), Err(Error::EngineUnavailable(_))));
        assert!(!engine.is_open());
    }

    #[test]
    fn test_table_crud() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let meta = engine.table::<MetaRecord>("meta").unwrap();

        meta.put(&MetaRecord {
            key: "version".into(),
            value: json!(1),
        })
        .unwrap();
        meta.put(&MetaRecord {
            key: "version".into(),
            value: json!(2),
        })
        .unwrap();

        let stored = meta.get("version").unwrap().unwrap();
        assert_eq!(stored.value, json!(2));
        assert_eq!(meta.to_array().unwrap().len(), 1);

        meta.delete("version").unwrap();
        assert!(meta.get("version").unwrap().is_none());
    }

    #[test]
    fn test_bulk_put_and_clear() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let entries = engine.table::<Value>("entries").unwrap();

        entries
            .bulk_put(&[json!({"date": "2024-01-02"}), json!({"date": "2024-01-01"})])
            .unwrap();
        let all = entries.to_array().unwrap();
        assert_eq!(all[0]["date"], "2024-01-01");
        assert_eq!(all.len(), 2);

        entries.clear().unwrap();
        assert!(entries.to_array().unwrap().is_empty());
    }

    #[test]
    fn test_failed_operation_rolls_back_whole_transaction() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let entries = engine.table::<Value>("entries").unwrap();
        entries.put(&json!({"date": "2024-01-01"})).unwrap();

        let result = entries.bulk_put(&[json!({"date": "2024-01-02"}), json!({"nodate": true})]);
        assert!(matches!(result, Err(Error::TransactionAborted { .. })));
        assert_eq!(entries.to_array().unwrap().len(), 1);

        let result: Result<()> = engine.transaction("entries", TxMode::ReadWrite, |tx| {
            tx.clear()?;
            Err(Error::Schema("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(entries.to_array().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_commit_is_aborted() {
        let host = Arc::new(MemoryHost::new());
        let engine = engine_on(host.clone());
        let entries = engine.table::<Value>("entries").unwrap();

        host.set_fail_writes(true);
        let result = entries.put(&json!({"date": "2024-01-01"}));
        assert!(matches!(result, Err(Error::TransactionAborted { .. })));

        host.set_fail_writes(false);
        assert!(entries.to_array().unwrap().is_empty());
    }

    #[test]
    fn test_other_table_usable_inside_transaction() {
        let engine = Arc::new(engine_on(Arc::new(MemoryHost::new())));
        let meta = engine.table::<Value>("meta").unwrap();
        meta.put(&json!({"key": "version", "value": 1})).unwrap();

        let (done, rx) = std::sync::mpsc::channel();
        let worker = Arc::clone(&engine);
        std::thread::spawn(move || {
            let result = worker.transaction("entries", TxMode::ReadWrite, |tx| {
                tx.put(json!({"date": "2024-01-01"}))?;
                let version = worker.table::<Value>("meta")?.get("version")?;
                Ok(version.map(|v| v["value"].clone()))
            });
            let _ = done.send(result);
        });

        let result = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("transaction did not finish");
        assert_eq!(result.unwrap(), Some(json!(1)));
        assert_eq!(engine.table::<Value>("entries").unwrap().to_array().unwrap().len(), 1);
    }

    #[test]
    fn test_same_table_reentry_is_aborted() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let entries = engine.table::<Value>("entries").unwrap();

        let result = engine.transaction("entries", TxMode::ReadWrite, |tx| {
            tx.put(json!({"date": "2024-01-01"}))?;
            entries.to_array()
        });
        assert!(matches!(result, Err(Error::TransactionAborted { .. })));

        // The outer transaction rolled back and the gate was released
        assert!(entries.to_array().unwrap().is_empty());
        entries.put(&json!({"date": "2024-01-02"})).unwrap();
        assert_eq!(entries.to_array().unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let result = engine.transaction("entries", TxMode::ReadOnly, |tx| {
            tx.put(json!({"date": "2024-01-01"}))
        });
        assert!(matches!(result, Err(Error::TransactionAborted { .. })));
    }

    #[test]
    fn test_auto_increment_keys() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        let log = engine.table::<Value>("log").unwrap();
        assert_eq!(log.put(&json!({"msg": "a"})).unwrap(), Key::Int(1));
        assert_eq!(log.put(&json!({"msg": "b"})).unwrap(), Key::Int(2));
        assert_eq!(log.get(2i64).unwrap().unwrap()["msg"], "b");
    }

    #[test]
    fn test_unknown_table() {
        let engine = engine_on(Arc::new(MemoryHost::new()));
        assert!(matches!(
            engine.table::<Value>("nope"),
            Err(Error::UnknownTable(_))
        ));
    }

    #[test]
    fn test_concurrent_open_connects_once() {
        let host = Arc::new(MemoryHost::new());
        let engine = engine_on(host.clone());

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| engine.open().unwrap());
            }
        });

        assert!(engine.is_open());
        assert_eq!(host.connection_count(), 1);
    }

    #[test]
    fn test_version_change_closes_and_reopens() {
        let host = Arc::new(MemoryHost::new());
        let engine = engine_on(host.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        engine.on_version_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let entries = engine.table::<Value>("entries").unwrap();
        entries.put(&json!({"date": "2024-01-01"})).unwrap();

        // Another writer upgrades mid-session
        host.bump_version("diary", 2);
        let result = entries.put(&json!({"date": "2024-01-02"}));
        assert!(matches!(result, Err(Error::TransactionAborted { .. })));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(!engine.is_open());

        // The stored version is now newer than ours
        assert!(matches!(
            engine.open(),
            Err(Error::VersionConflict { stored: 2, declared: 1 })
        ));
    }

    #[test]
    fn test_explicit_close_reopens_transparently() {
        let host = Arc::new(MemoryHost::new());
        let engine = engine_on(host.clone());
        let entries = engine.table::<Value>("entries").unwrap();
        entries.put(&json!({"date": "2024-01-01"})).unwrap();

        engine.notify_version_change();
        assert!(!engine.is_open());
        assert_eq!(entries.to_array().unwrap().len(), 1);
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn test_schema_cannot_change_while_open() {
        let mut engine = engine_on(Arc::new(MemoryHost::new()));
        engine.open().unwrap();
        assert!(engine.declare_schema(schema()).is_err());
    }

    #[test]
    fn test_file_backed_engine_persists_across_instances() {
        let temp_dir = tempfile::tempdir().unwrap();
        let host: Arc<dyn StorageHost> = Arc::new(FileHost::new(temp_dir.path()));

        let mut first = Engine::new("diary", host.clone());
        first.declare_schema(schema()).unwrap();
        first
            .table::<Value>("entries")
            .unwrap()
            .put(&json!({"date": "2024-02-02", "nrs": 3}))
            .unwrap();
        first.close();

        let mut second = Engine::new("diary", host);
        second.declare_schema(schema()).unwrap();
        let stored = second
            .table::<Value>("entries")
            .unwrap()
            .get("2024-02-02")
            .unwrap()
            .unwrap();
        assert_eq!(stored["nrs"], 3);
    }
}
