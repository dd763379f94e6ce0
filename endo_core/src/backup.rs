//! JSON backup export and import.

use crate::crypto::passphrase_is_usable;
use crate::store::sanitize_with;
use crate::{DailyEntry, DiaryStore, Error, PbacRules, Result, SaveOutcome, SettingsRecord};
use serde_json::Value;

/// Serialize entries as a pretty-printed JSON array
pub fn export_json(entries: &[DailyEntry]) -> Result<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}

/// Parse a backup: either a bare entry array or `{"entries": [...]}`
///
/// Records are sanitized the same way as on load.
pub fn import_json(text: &str) -> Result<Vec<DailyEntry>> {
    import_json_with(text, PbacRules::standard())
}

pub(crate) fn import_json_with(text: &str, rules: &PbacRules) -> Result<Vec<DailyEntry>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::Backup(format!("not valid JSON: {}", e)))?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("entries") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(Error::Backup(
                    "expected an 'entries' array in the backup object".into(),
                ))
            }
        },
        _ => {
            return Err(Error::Backup(
                "backup must be an entry array or an object with 'entries'".into(),
            ))
        }
    };
    Ok(sanitize_with(rows, rules))
}

impl DiaryStore {
    /// Replace the stored collection with the contents of a backup
    ///
    /// The backup is validated before anything is written. With encryption
    /// on and an unusable passphrase the import is refused with `Skipped`.
    pub fn import_backup(
        &self,
        text: &str,
        passphrase: &str,
        settings: &SettingsRecord,
    ) -> Result<SaveOutcome> {
        let entries = import_json_with(text, self.rules())?;
        if settings.encryption && !passphrase_is_usable(passphrase) {
            tracing::info!("Refusing backup import without a usable passphrase");
            return Ok(SaveOutcome::Skipped);
        }
        tracing::info!("Importing {} entries from backup", entries.len());
        self.save_entries(&entries, passphrase, settings)
    }
}
