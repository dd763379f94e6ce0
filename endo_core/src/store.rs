//! Diary persistence: settings, the entry collection and the cipher bundle.
//!
//! The store owns two tables on one versioned database:
//! - `entries`, keyed by date, holding plaintext entries when encryption is off
//! - `meta`, keyed by name, holding `settings`, `enc_bundle` and `version`
//!
//! When an `enc_bundle` record exists it is the authoritative copy of the
//! entries and the `entries` table is kept empty.

use crate::config::Config;
use crate::crypto::{passphrase_is_usable, CryptoCodec, Unsealed};
use crate::engine::{Engine, FileHost, Key, Schema, StorageHost, TableSchema, TxMode};
use crate::pbac::{normalize_pbac, PbacRules};
use crate::{
    CipherBundle, CipherMode, DailyEntry, LoadedEntries, MetaRecord, Result, SaveOutcome,
    SettingsPatch, SettingsRecord,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub const DATABASE_NAME: &str = "endo-mini-storage";
pub const DB_VERSION: u32 = 1;
pub const ENTRIES_TABLE: &str = "entries";
pub const META_TABLE: &str = "meta";
pub const SETTINGS_KEY: &str = "settings";
pub const BUNDLE_KEY: &str = "enc_bundle";
/// Migration marker; present once the legacy import has completed
pub const VERSION_KEY: &str = "version";
pub const DATA_VERSION: u32 = 1;

/// Tables of the diary database
pub fn diary_schema() -> Schema {
    Schema::new(DB_VERSION)
        .table(TableSchema::keyed(ENTRIES_TABLE, "date"))
        .table(TableSchema::keyed(META_TABLE, "key"))
}

/// Persistence handle for one diary database
///
/// Construct once per process and pass it by reference; it holds the only
/// connection to the database.
#[derive(Debug)]
pub struct DiaryStore {
    engine: Engine,
    codec: CryptoCodec,
    rules: PbacRules,
    kdf_iterations: Option<u32>,
}

impl DiaryStore {
    /// Wrap an engine, declaring the diary schema on it
    pub fn new(mut engine: Engine, codec: CryptoCodec) -> Result<Self> {
        engine.declare_schema(diary_schema())?;
        Ok(Self {
            engine,
            codec,
            rules: PbacRules::default(),
            kdf_iterations: None,
        })
    }

    /// Store over an arbitrary host; the database opens on first use
    pub fn with_host(
        name: &str,
        host: Arc<dyn StorageHost>,
        codec: CryptoCodec,
    ) -> Result<Self> {
        Self::new(Engine::new(name, host), codec)
    }

    /// File-backed store described by the configuration
    ///
    /// Opens the database eagerly so a host without usable storage fails
    /// here, once, with `EngineUnavailable`.
    pub fn open(config: &Config) -> Result<Self> {
        let host = FileHost::new(config.database_root());
        let store = Self::with_host(
            &config.storage.database_name,
            Arc::new(host),
            CryptoCodec::system(),
        )?
        .with_rules(config.pbac.clone());
        store.engine.open()?;
        Ok(store)
    }

    /// Use these rules when normalizing PBAC records
    pub fn with_rules(mut self, rules: PbacRules) -> Self {
        self.rules = rules;
        self
    }

    /// Fix the KDF iteration count instead of deriving it from settings
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = Some(iterations);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn codec(&self) -> &CryptoCodec {
        &self.codec
    }

    pub fn rules(&self) -> &PbacRules {
        &self.rules
    }

    // ------------------------------------------------------------------
    // Meta records
    // ------------------------------------------------------------------

    pub(crate) fn meta_value(&self, key: &str) -> Result<Option<Value>> {
        let meta = self.engine.table::<MetaRecord>(META_TABLE)?;
        Ok(meta.get(key)?.map(|record| record.value))
    }

    pub(crate) fn put_meta(&self, key: &str, value: Value) -> Result<()> {
        let meta = self.engine.table::<MetaRecord>(META_TABLE)?;
        meta.put(&MetaRecord {
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    pub(crate) fn delete_meta(&self, key: &str) -> Result<()> {
        self.engine.table::<MetaRecord>(META_TABLE)?.delete(key)
    }

    /// Whether an encrypted (or plain-mode) bundle currently holds the entries
    pub fn has_bundle(&self) -> Result<bool> {
        Ok(self
            .meta_value(BUNDLE_KEY)?
            .is_some_and(|value| !value.is_null()))
    }

    /// The migration marker, if the legacy import has completed
    pub fn data_version(&self) -> Result<Option<u32>> {
        Ok(self
            .meta_value(VERSION_KEY)?
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0))
    }

    pub(crate) fn mark_migrated(&self) -> Result<()> {
        self.put_meta(VERSION_KEY, Value::from(DATA_VERSION))
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Stored settings merged over the defaults, field by field
    ///
    /// Never fails: an unreadable or malformed record yields the defaults.
    pub fn load_settings(&self) -> SettingsRecord {
        match self.meta_value(SETTINGS_KEY) {
            Ok(Some(value)) if value.is_object() => {
                SettingsRecord::default().merged(&SettingsPatch::from_value(&value))
            }
            Ok(_) => SettingsRecord::default(),
            Err(e) => {
                tracing::warn!("Failed to load settings: {}. Using defaults.", e);
                SettingsRecord::default()
            }
        }
    }

    /// Merge `patch` over the current settings and persist the result
    pub fn save_settings(&self, patch: &SettingsPatch) -> Result<SettingsRecord> {
        let next = self.load_settings().merged(patch);
        self.put_meta(SETTINGS_KEY, serde_json::to_value(next)?)?;
        tracing::debug!("Saved settings {:?}", next);
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Read the entry collection
    ///
    /// A stored bundle always wins over the `entries` table. If it cannot be
    /// opened with `passphrase` the result is `locked` with no entries;
    /// decryption problems are never reported as errors.
    pub fn load_entries(
        &self,
        passphrase: &str,
        settings: &SettingsRecord,
    ) -> Result<LoadedEntries> {
        let raw_bundle = match self.meta_value(BUNDLE_KEY)? {
            Some(value) if !value.is_null() => value,
            _ => {
                if settings.encryption {
                    tracing::debug!("Encryption is on but no bundle exists yet");
                }
                let rows = self.engine.table::<Value>(ENTRIES_TABLE)?.to_array()?;
                return Ok(LoadedEntries::unlocked(sanitize_with(rows, &self.rules)));
            }
        };

        if !passphrase_is_usable(passphrase) {
            tracing::debug!("Passphrase too short, not attempting decryption");
            return Ok(LoadedEntries::locked());
        }

        let bundle: CipherBundle = match serde_json::from_value(raw_bundle) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!("Stored bundle is malformed: {}", e);
                return Ok(LoadedEntries::locked());
            }
        };

        let bytes = match self.codec.decrypt(&bundle, passphrase) {
            Unsealed::Bytes(bytes) => bytes,
            Unsealed::Locked => return Ok(LoadedEntries::locked()),
        };

        match serde_json::from_slice::<Vec<Value>>(&bytes) {
            Ok(rows) => Ok(LoadedEntries::unlocked(sanitize_with(rows, &self.rules))),
            Err(e) if bundle.mode == CipherMode::Plain => {
                tracing::warn!("Plain bundle does not hold an entry array: {}", e);
                Ok(LoadedEntries::unlocked(Vec::new()))
            }
            Err(e) => {
                tracing::warn!("Decrypted bundle does not hold an entry array: {}", e);
                Ok(LoadedEntries::locked())
            }
        }
    }

    /// Persist the whole entry collection
    ///
    /// With encryption on and an unusable passphrase nothing is written and
    /// `Skipped` is returned.
    pub fn save_entries(
        &self,
        entries: &[DailyEntry],
        passphrase: &str,
        settings: &SettingsRecord,
    ) -> Result<SaveOutcome> {
        let values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let sanitized = sanitize_with(values, &self.rules);

        if settings.encryption && !passphrase_is_usable(passphrase) {
            tracing::info!("Encryption is on but the passphrase is unusable, skipping save");
            return Ok(SaveOutcome::Skipped);
        }

        self.put_meta(VERSION_KEY, Value::from(DATA_VERSION))?;

        if settings.encryption {
            let iterations = self
                .kdf_iterations
                .unwrap_or_else(|| settings.kdf_iterations());
            let plain = serde_json::to_vec(&sanitized)?;
            let bundle = self.codec.encrypt(&plain, Some(passphrase), iterations)?;
            if bundle.mode == CipherMode::Plain {
                tracing::warn!("Crypto unavailable, entry bundle stored without encryption");
            }

            // Bundle first: the plaintext table is only cleared once the
            // sealed copy is committed.
            self.put_meta(BUNDLE_KEY, serde_json::to_value(&bundle)?)?;
            self.engine.table::<Value>(ENTRIES_TABLE)?.clear()?;
            tracing::debug!("Saved {} entries encrypted", sanitized.len());
            return Ok(SaveOutcome::Encrypted);
        }

        self.replace_entries(&sanitized)?;
        self.delete_meta(BUNDLE_KEY)?;
        tracing::debug!("Saved {} entries in plaintext", sanitized.len());
        Ok(SaveOutcome::Plain)
    }

    /// Swap the `entries` table contents in a single transaction
    pub(crate) fn replace_entries(&self, entries: &[DailyEntry]) -> Result<()> {
        let values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.engine
            .transaction(ENTRIES_TABLE, TxMode::ReadWrite, |tx| {
                tx.clear()?;
                for value in values {
                    tx.put(value)?;
                }
                Ok(())
            })
    }

    /// Replace the entry with the same date, or add it
    ///
    /// Refuses with `Skipped` while the store is locked, so inaccessible data
    /// is never overwritten by a partial collection.
    pub fn upsert_entry(
        &self,
        entry: DailyEntry,
        passphrase: &str,
        settings: &SettingsRecord,
    ) -> Result<SaveOutcome> {
        let loaded = self.load_entries(passphrase, settings)?;
        if loaded.locked {
            tracing::info!("Store is locked, not updating {}", entry.date);
            return Ok(SaveOutcome::Skipped);
        }

        let mut entries = loaded.entries;
        match entries.iter_mut().find(|e| e.date == entry.date) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        entries.sort_by(|a, b| a.date.cmp(&b.date));
        self.save_entries(&entries, passphrase, settings)
    }

    /// Close the connection and delete the whole database
    pub fn clear_database(&self) -> Result<()> {
        self.engine.destroy().map_err(|e| {
            tracing::error!("Failed to delete database {}: {}", self.engine.name(), e);
            e
        })
    }

    /// Number of rows in the plaintext `entries` table
    pub fn plaintext_entry_count(&self) -> Result<usize> {
        self.engine
            .transaction(ENTRIES_TABLE, TxMode::ReadOnly, |tx| Ok(tx.len()))
    }

    /// Whether a plaintext entry exists for `date`
    pub fn has_plaintext_entry(&self, date: &str) -> Result<bool> {
        let key = Key::from(date);
        self.engine
            .transaction(ENTRIES_TABLE, TxMode::ReadOnly, |tx| Ok(tx.get(&key).is_some()))
    }
}

/// Drop records without a string date and all but the first record per date
///
/// PBAC records are normalized with the standard rules. The result is
/// stable: sanitizing a sanitized collection changes nothing.
pub fn sanitize_entries(raw: impl IntoIterator<Item = Value>) -> Vec<DailyEntry> {
    sanitize_with(raw, PbacRules::standard())
}

pub(crate) fn sanitize_with(
    raw: impl IntoIterator<Item = Value>,
    rules: &PbacRules,
) -> Vec<DailyEntry> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|value| sanitize_one(value, rules))
        .filter(|entry| seen.insert(entry.date.clone()))
        .collect()
}

fn sanitize_one(raw: Value, rules: &PbacRules) -> Option<DailyEntry> {
    let Value::Object(mut fields) = raw else {
        return None;
    };
    let date = match fields.remove("date") {
        Some(Value::String(date)) if !date.is_empty() => date,
        _ => return None,
    };
    let pbac = match fields.remove("pbac") {
        None | Some(Value::Null) => None,
        Some(value) => Some(normalize_pbac(&value, rules)),
    };
    Some(DailyEntry { date, pbac, fields })
}
