#![forbid(unsafe_code)]

//! Local data engine for the Endo Mini health diary.
//!
//! This crate provides:
//! - Domain types (daily entries, PBAC records, settings, cipher bundles)
//! - A transactional key-value engine over a pluggable storage host
//! - Passphrase-based encryption of the entry collection
//! - Persistence (settings, entries, legacy migration, backups)
//! - Derived analytics (PBAC day scores, bleeding cycles)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod engine;
pub mod crypto;
pub mod legacy;
pub mod store;
pub mod migration;
pub mod pbac;
pub mod cycles;
pub mod backup;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use engine::{Engine, FileHost, MemoryHost, Schema, StorageHost, TableSchema};
pub use crypto::CryptoCodec;
pub use legacy::{JsonFileLegacyStore, LegacyStore, MemoryLegacyStore};
pub use store::{sanitize_entries, DiaryStore};
pub use migration::{migrate_from_legacy, MigrationOutcome, MigrationReport};
pub use pbac::{compute_day_score, normalize_pbac, PbacRules};
pub use cycles::{build_period_flags, detect_cycles, PeriodFlags};
