//! Core domain types for the Endo Mini diary.
//!
//! This module defines the fundamental types used throughout the system:
//! - Daily entries and their PBAC bleeding records
//! - Application settings stored in the database
//! - The cipher bundle envelope for encrypted collections
//! - Derived bleeding cycles

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// PBAC Types
// ============================================================================

/// Kind of menstrual product tracked by the PBAC chart
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Pad,
    Tampon,
}

/// How saturated a product was when changed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FillLevel {
    Light,
    Medium,
    Heavy,
}

impl FillLevel {
    /// Index into a product weight table
    pub fn index(self) -> usize {
        match self {
            FillLevel::Light => 0,
            FillLevel::Medium => 1,
            FillLevel::Heavy => 2,
        }
    }
}

/// Largest clot size observed during the day
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClotSize {
    #[default]
    None,
    Small,
    Large,
}

/// Why a day carries no PBAC score
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AbsentReason {
    Unknown,
    NotAsked,
    AskedDeclined,
    /// Explicitly no bleeding
    NotApplicable,
    Error,
}

/// A product used during the day
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Product {
    pub kind: ProductKind,
    pub fill: FillLevel,
}

/// A day's raw bleeding inputs plus the derived day score
///
/// Deserialization goes through [`crate::pbac::normalize_pbac`], so older or
/// partially malformed shapes are accepted and `day_score` is always
/// recomputed on read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "Value")]
pub struct PbacRecord {
    pub products: Vec<Product>,
    pub clots: ClotSize,
    pub flooding_episodes: u32,
    pub cup_ml: u32,
    pub period_start: bool,
    pub day_score: Option<u32>,
    #[serde(rename = "absent_reason")]
    pub absent_reason: Option<AbsentReason>,
}

impl Default for PbacRecord {
    fn default() -> Self {
        Self {
            products: Vec::new(),
            clots: ClotSize::None,
            flooding_episodes: 0,
            cup_ml: 0,
            period_start: false,
            day_score: None,
            absent_reason: Some(AbsentReason::NotAsked),
        }
    }
}

// ============================================================================
// Entry Types
// ============================================================================

/// One diary entry, keyed by its ISO calendar date
///
/// Only the PBAC record is interpreted by this crate; every other field is
/// carried through untouched in `fields`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DailyEntry {
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbac: Option<PbacRecord>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DailyEntry {
    /// Create an empty entry for the given day
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date: date.format("%Y-%m-%d").to_string(),
            pbac: None,
            fields: Map::new(),
        }
    }

    /// Attach a PBAC record
    pub fn with_pbac(mut self, pbac: PbacRecord) -> Self {
        self.pbac = Some(pbac);
        self
    }

    /// Parse the entry's date, if it is a valid ISO date
    pub fn parsed_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()
    }

    /// The stored PBAC day score, if any
    pub fn day_score(&self) -> Option<u32> {
        self.pbac.as_ref().and_then(|p| p.day_score)
    }
}

/// Result of reading the entry collection
#[derive(Clone, Debug, PartialEq, Default)]
pub struct LoadedEntries {
    pub entries: Vec<DailyEntry>,
    /// Data exists but could not be decrypted with the given passphrase
    pub locked: bool,
}

impl LoadedEntries {
    pub fn unlocked(entries: Vec<DailyEntry>) -> Self {
        Self {
            entries,
            locked: false,
        }
    }

    pub fn locked() -> Self {
        Self {
            entries: Vec::new(),
            locked: true,
        }
    }
}

/// What a save actually did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Entries written in plaintext to the entries table
    Plain,
    /// Entries sealed into the cipher bundle
    Encrypted,
    /// Nothing was written: encryption is on but the passphrase is unusable
    Skipped,
}

// ============================================================================
// Settings and Meta Types
// ============================================================================

/// Application settings persisted in the `meta` table
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsRecord {
    pub quick_mode: bool,
    pub encryption: bool,
    pub kdf_strong: bool,
    pub compact_pdf: bool,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            quick_mode: true,
            encryption: false,
            kdf_strong: false,
            compact_pdf: false,
        }
    }
}

impl SettingsRecord {
    /// KDF iteration count selected by `kdf_strong`
    pub fn kdf_iterations(&self) -> u32 {
        if self.kdf_strong {
            crate::crypto::KDF_ITERATIONS_STRONG
        } else {
            crate::crypto::KDF_ITERATIONS
        }
    }

    /// Apply every field present in the patch
    pub fn merged(&self, patch: &SettingsPatch) -> Self {
        Self {
            quick_mode: patch.quick_mode.unwrap_or(self.quick_mode),
            encryption: patch.encryption.unwrap_or(self.encryption),
            kdf_strong: patch.kdf_strong.unwrap_or(self.kdf_strong),
            compact_pdf: patch.compact_pdf.unwrap_or(self.compact_pdf),
        }
    }
}

/// A partial settings update
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub quick_mode: Option<bool>,
    pub encryption: Option<bool>,
    pub kdf_strong: Option<bool>,
    pub compact_pdf: Option<bool>,
}

impl SettingsPatch {
    /// Pick out every well-typed settings field from an arbitrary JSON value
    ///
    /// Fields that are missing or not booleans are left unset, so an older or
    /// damaged persisted record still contributes whatever it can.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_bool);
        Self {
            quick_mode: field("quickMode"),
            encryption: field("encryption"),
            kdf_strong: field("kdfStrong"),
            compact_pdf: field("compactPdf"),
        }
    }
}

/// A generic `{key, value}` row of the `meta` table
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetaRecord {
    pub key: String,
    pub value: Value,
}

// ============================================================================
// Cipher Bundle
// ============================================================================

/// How the bundle's `data` is encoded
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Gcm,
    Plain,
}

/// Versioned envelope describing how the entry collection is sealed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CipherBundle {
    pub mode: CipherMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iter: Option<u32>,
    #[serde(default = "default_bundle_version")]
    pub version: u32,
    #[serde(default)]
    pub data: String,
}

fn default_bundle_version() -> u32 {
    crate::crypto::BUNDLE_VERSION
}

impl CipherBundle {
    /// A bundle carrying serialized JSON verbatim
    pub fn plain(data: String) -> Self {
        Self {
            mode: CipherMode::Plain,
            iv: None,
            salt: None,
            iter: None,
            version: crate::crypto::BUNDLE_VERSION,
            data,
        }
    }
}

// ============================================================================
// Cycle Types
// ============================================================================

/// One day inside a reconstructed bleeding cycle
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CycleDay {
    pub date: NaiveDate,
    pub pbac: u32,
    pub spotting: bool,
}

/// A reconstructed bleeding cycle; derived, never persisted
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cycle {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<CycleDay>,
    /// Sum over bleeding days only
    pub pbac_sum: u32,
}

impl Cycle {
    /// First bleeding (non-spotting) day
    pub fn first_bleeding_day(&self) -> Option<NaiveDate> {
        self.days.iter().find(|d| !d.spotting).map(|d| d.date)
    }

    /// Number of recorded days, spotting included
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}
