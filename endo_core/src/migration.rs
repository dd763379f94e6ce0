//! One-time import from the legacy flat key-value store.
//!
//! Runs on every startup but does work only once per database: completion
//! is recorded by the `version` meta marker. Storage failures abandon the
//! run without writing the marker, so the next startup retries.

use crate::legacy::{LegacyStore, LEGACY_BUNDLE_KEY, LEGACY_ENTRIES_KEY, LEGACY_SETTINGS_KEY};
use crate::store::{sanitize_with, BUNDLE_KEY, ENTRIES_TABLE};
use crate::{DiaryStore, Result, SettingsPatch};
use serde_json::Value;

/// What a completed migration imported
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub settings: bool,
    pub bundle: bool,
    /// Number of plaintext entries imported, if the entry array was migrated
    pub entries: Option<usize>,
}

impl MigrationReport {
    /// Nothing was found to import
    pub fn is_empty(&self) -> bool {
        !self.settings && !self.bundle && self.entries.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The marker was already present; nothing was touched
    AlreadyMigrated,
    Migrated(MigrationReport),
    /// A storage operation failed; the marker was not written
    Abandoned { reason: String },
}

/// Import legacy settings, entries and bundle into the database
///
/// Never fails: every problem is logged and reported through the outcome.
pub fn migrate_from_legacy(store: &DiaryStore, legacy: &dyn LegacyStore) -> MigrationOutcome {
    if let Err(e) = store.engine().open() {
        tracing::error!("Could not open database for migration: {}", e);
        return MigrationOutcome::Abandoned {
            reason: e.to_string(),
        };
    }

    match run(store, legacy) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Migration failed, will retry on next start: {}", e);
            MigrationOutcome::Abandoned {
                reason: e.to_string(),
            }
        }
    }
}

fn run(store: &DiaryStore, legacy: &dyn LegacyStore) -> Result<MigrationOutcome> {
    if store.data_version()?.is_some() {
        tracing::debug!("Legacy migration already done");
        return Ok(MigrationOutcome::AlreadyMigrated);
    }

    let raw_settings = legacy.get_item(LEGACY_SETTINGS_KEY)?;
    let raw_entries = legacy.get_item(LEGACY_ENTRIES_KEY)?;
    let raw_bundle = legacy.get_item(LEGACY_BUNDLE_KEY)?;
    let mut report = MigrationReport::default();

    if let Some(raw) = raw_settings {
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) if value.is_object() => {
                store.save_settings(&SettingsPatch::from_value(&value))?;
                report.settings = true;
            }
            Ok(_) => tracing::warn!("Legacy settings are not an object, skipping"),
            Err(e) => tracing::warn!("Legacy settings could not be parsed: {}", e),
        }
    }

    // A bundle is authoritative; plaintext entries are only imported without one
    if let Some(raw) = raw_bundle {
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(mut bundle)) => {
                if bundle.get("version").map_or(true, Value::is_null) {
                    bundle.insert("version".into(), Value::from(crate::crypto::BUNDLE_VERSION));
                }
                store.put_meta(BUNDLE_KEY, Value::Object(bundle))?;
                store.engine().table::<Value>(ENTRIES_TABLE)?.clear()?;
                report.bundle = true;
            }
            Ok(_) => tracing::warn!("Legacy bundle is not an object, skipping"),
            Err(e) => tracing::warn!("Legacy bundle could not be parsed: {}", e),
        }
    } else if let Some(raw) = raw_entries {
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                let rows = match value {
                    Value::Array(rows) => rows,
                    _ => {
                        tracing::warn!("Legacy entries are not an array, importing none");
                        Vec::new()
                    }
                };
                let entries = sanitize_with(rows, store.rules());
                store.replace_entries(&entries)?;
                report.entries = Some(entries.len());
            }
            Err(e) => tracing::warn!("Legacy entries could not be parsed: {}", e),
        }
    }

    if !report.is_empty() {
        for key in [LEGACY_ENTRIES_KEY, LEGACY_BUNDLE_KEY, LEGACY_SETTINGS_KEY] {
            legacy.remove_item(key)?;
        }
    }

    store.mark_migrated()?;
    tracing::info!("Legacy migration complete: {:?}", report);
    Ok(MigrationOutcome::Migrated(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryHost;
    use crate::legacy::MemoryLegacyStore;
    use crate::store::DATABASE_NAME;
    use crate::{CryptoCodec, SettingsRecord};
    use std::sync::Arc;

    fn store_on(host: Arc<MemoryHost>) -> DiaryStore {
        DiaryStore::with_host(DATABASE_NAME, host, CryptoCodec::system()).unwrap()
    }

    fn legacy_with(items: &[(&str, &str)]) -> MemoryLegacyStore {
        let legacy = MemoryLegacyStore::new();
        for (key, value) in items {
            legacy.set_item(key, value).unwrap();
        }
        legacy
    }

    const ENTRIES: &str = r#"[
        {"date": "2024-05-01", "nrs": 3},
        {"date": "2024-05-02", "pbac": {"products": [{"kind": "pad", "fill": "heavy"}]}},
        {"date": "2024-05-01", "nrs": 9},
        {"nrs": 1}
    ]"#;

    #[test]
    fn test_fresh_database_without_legacy_data() {
        let store = store_on(Arc::new(MemoryHost::new()));
        let outcome = migrate_from_legacy(&store, &MemoryLegacyStore::new());
        assert_eq!(outcome, MigrationOutcome::Migrated(MigrationReport::default()));
        assert_eq!(store.data_version().unwrap(), Some(1));
    }

    #[test]
    fn test_imports_settings_and_entries_once() {
        let store = store_on(Arc::new(MemoryHost::new()));
        let legacy = legacy_with(&[
            (LEGACY_SETTINGS_KEY, r#"{"quickMode": false, "compactPdf": true}"#),
            (LEGACY_ENTRIES_KEY, ENTRIES),
        ]);

        let outcome = migrate_from_legacy(&store, &legacy);
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated(MigrationReport {
                settings: true,
                bundle: false,
                entries: Some(2),
            })
        );
        assert!(legacy.is_empty());

        let settings = store.load_settings();
        assert!(!settings.quick_mode);
        assert!(settings.compact_pdf);
        let loaded = store.load_entries("", &settings).unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[0].fields["nrs"], 3);
        assert_eq!(loaded.entries[1].day_score(), Some(20));

        // New legacy data after the marker is ignored
        legacy.set_item(LEGACY_ENTRIES_KEY, "[]").unwrap();
        legacy
            .set_item(LEGACY_SETTINGS_KEY, r#"{"quickMode": true}"#)
            .unwrap();
        assert_eq!(
            migrate_from_legacy(&store, &legacy),
            MigrationOutcome::AlreadyMigrated
        );
        assert_eq!(store.load_settings(), settings);
        assert_eq!(store.load_entries("", &settings).unwrap(), loaded);
        assert_eq!(legacy.len(), 2);
    }

    #[test]
    fn test_bundle_takes_priority_over_entries() {
        let store = store_on(Arc::new(MemoryHost::new()));
        let sealed = CryptoCodec::system()
            .encrypt(br#"[{"date": "2024-06-01"}]"#, Some("old passphrase"), 1_000)
            .unwrap();
        let mut raw_bundle = serde_json::to_value(&sealed).unwrap();
        raw_bundle.as_object_mut().unwrap().remove("version");
        let raw_bundle = raw_bundle.to_string();

        let legacy = legacy_with(&[
            (LEGACY_BUNDLE_KEY, raw_bundle.as_str()),
            (LEGACY_ENTRIES_KEY, ENTRIES),
        ]);
        let outcome = migrate_from_legacy(&store, &legacy);
        assert!(matches!(
            outcome,
            MigrationOutcome::Migrated(MigrationReport {
                bundle: true,
                entries: None,
                ..
            })
        ));
        assert!(legacy.is_empty());
        assert_eq!(store.plaintext_entry_count().unwrap(), 0);
        assert_eq!(store.meta_value(BUNDLE_KEY).unwrap().unwrap()["version"], 1);

        let settings = SettingsRecord::default();
        assert!(store.load_entries("", &settings).unwrap().locked);
        let loaded = store.load_entries("old passphrase", &settings).unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].date, "2024-06-01");
    }

    #[test]
    fn test_unparseable_items_are_skipped() {
        let store = store_on(Arc::new(MemoryHost::new()));
        let legacy = legacy_with(&[
            (LEGACY_SETTINGS_KEY, "{not json"),
            (LEGACY_ENTRIES_KEY, r#"[{"date": "2024-07-01"}]"#),
        ]);
        let outcome = migrate_from_legacy(&store, &legacy);
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated(MigrationReport {
                settings: false,
                bundle: false,
                entries: Some(1),
            })
        );
        assert_eq!(store.load_settings(), SettingsRecord::default());
    }

    #[test]
    fn test_nothing_usable_keeps_legacy_data() {
        let store = store_on(Arc::new(MemoryHost::new()));
        let legacy = legacy_with(&[(LEGACY_SETTINGS_KEY, "42")]);
        let outcome = migrate_from_legacy(&store, &legacy);
        assert_eq!(outcome, MigrationOutcome::Migrated(MigrationReport::default()));
        assert_eq!(legacy.len(), 1);
    }

    #[test]
    fn test_failed_write_is_retried_next_run() {
        let host = Arc::new(MemoryHost::new());
        let store = store_on(host.clone());
        store.engine().open().unwrap();
        let legacy = legacy_with(&[(LEGACY_ENTRIES_KEY, ENTRIES)]);

        host.set_fail_writes(true);
        let outcome = migrate_from_legacy(&store, &legacy);
        assert!(matches!(outcome, MigrationOutcome::Abandoned { .. }));
        host.set_fail_writes(false);
        assert_eq!(store.data_version().unwrap(), None);
        assert_eq!(legacy.len(), 1);

        let outcome = migrate_from_legacy(&store, &legacy);
        assert!(matches!(outcome, MigrationOutcome::Migrated(_)));
        assert_eq!(store.plaintext_entry_count().unwrap(), 2);
    }

    #[test]
    fn test_unavailable_engine_abandons() {
        let store = store_on(Arc::new(MemoryHost::unavailable()));
        let legacy = legacy_with(&[(LEGACY_ENTRIES_KEY, ENTRIES)]);
        assert!(matches!(
            migrate_from_legacy(&store, &legacy),
            MigrationOutcome::Abandoned { .. }
        ));
        assert_eq!(legacy.len(), 1);
    }
}
