use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use endo_core::crypto::passphrase_is_usable;
use endo_core::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "endo")]
#[command(about = "Local data engine for the Endo Mini diary", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Passphrase for the encrypted diary
    #[arg(long, global = true, env = "ENDO_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import data from the legacy key-value file (runs once)
    Migrate {
        /// Legacy file to read instead of the configured one
        #[arg(long)]
        legacy_file: Option<PathBuf>,
    },

    /// Show or change application settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Record a day's bleeding inputs
    Log {
        /// Day to record (YYYY-MM-DD)
        date: NaiveDate,

        #[command(flatten)]
        inputs: PbacArgs,

        /// Mark the day as the first day of a period
        #[arg(long)]
        period_start: bool,

        /// Clear a previously recorded period start
        #[arg(long, conflicts_with = "period_start")]
        no_period_start: bool,

        /// Record the day without a score
        #[arg(long, value_enum, conflicts_with_all = ["pad", "tampon", "clots", "flooding", "cup"])]
        absent: Option<AbsentArg>,
    },

    /// Compute a PBAC score without storing anything
    Score {
        #[command(flatten)]
        inputs: PbacArgs,
    },

    /// Show reconstructed bleeding cycles
    Cycles {
        /// Print cycles as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export all entries as JSON (to stdout without a file)
    Export { file: Option<PathBuf> },

    /// Replace all entries with the contents of a JSON backup
    Import { file: PathBuf },

    /// Delete the local database
    Wipe,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings
    Show,

    /// Change one or more settings
    Set {
        #[arg(long)]
        quick_mode: Option<bool>,

        #[arg(long)]
        encryption: Option<bool>,

        #[arg(long)]
        kdf_strong: Option<bool>,

        #[arg(long)]
        compact_pdf: Option<bool>,
    },
}

#[derive(Args)]
struct PbacArgs {
    /// Pad fill level
    #[arg(long, value_enum)]
    pad: Option<FillArg>,

    /// Tampon fill level
    #[arg(long, value_enum)]
    tampon: Option<FillArg>,

    /// Largest clot size
    #[arg(long, value_enum)]
    clots: Option<ClotArg>,

    /// Number of flooding episodes
    #[arg(long, default_value_t = 0)]
    flooding: u32,

    /// Menstrual cup volume in ml (tracked, not scored)
    #[arg(long, default_value_t = 0)]
    cup: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum FillArg {
    Light,
    Medium,
    Heavy,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClotArg {
    None,
    Small,
    Large,
}

#[derive(Clone, Copy, ValueEnum)]
enum AbsentArg {
    Unknown,
    NotAsked,
    AskedDeclined,
    NotApplicable,
    Error,
}

impl From<FillArg> for FillLevel {
    fn from(arg: FillArg) -> Self {
        match arg {
            FillArg::Light => FillLevel::Light,
            FillArg::Medium => FillLevel::Medium,
            FillArg::Heavy => FillLevel::Heavy,
        }
    }
}

impl From<ClotArg> for ClotSize {
    fn from(arg: ClotArg) -> Self {
        match arg {
            ClotArg::None => ClotSize::None,
            ClotArg::Small => ClotSize::Small,
            ClotArg::Large => ClotSize::Large,
        }
    }
}

impl From<AbsentArg> for AbsentReason {
    fn from(arg: AbsentArg) -> Self {
        match arg {
            AbsentArg::Unknown => AbsentReason::Unknown,
            AbsentArg::NotAsked => AbsentReason::NotAsked,
            AbsentArg::AskedDeclined => AbsentReason::AskedDeclined,
            AbsentArg::NotApplicable => AbsentReason::NotApplicable,
            AbsentArg::Error => AbsentReason::Error,
        }
    }
}

impl PbacArgs {
    fn products(&self) -> Vec<Product> {
        let pads = self.pad.map(|fill| Product {
            kind: ProductKind::Pad,
            fill: fill.into(),
        });
        let tampons = self.tampon.map(|fill| Product {
            kind: ProductKind::Tampon,
            fill: fill.into(),
        });
        pads.into_iter().chain(tampons).collect()
    }

    fn clots(&self) -> ClotSize {
        self.clots.map(ClotSize::from).unwrap_or_default()
    }

    fn record(&self, rules: &PbacRules) -> PbacRecord {
        PbacRecord::from_inputs(self.products(), self.clots(), self.flooding, self.cup, rules)
    }

    /// Overwrite a stored record's inputs with these
    fn apply(&self, record: &mut PbacRecord, rules: &PbacRules) {
        record.set_inputs(self.products(), self.clots(), self.flooding, self.cup, rules);
    }
}

const LOCKED_MESSAGE: &str =
    "The diary is encrypted and could not be unlocked. Pass --passphrase or set ENDO_PASSPHRASE.";
const SKIPPED_MESSAGE: &str =
    "Nothing was written: encryption is on but the passphrase is missing or shorter than 4 characters.";

fn main() -> ExitCode {
    endo_core::logging::init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }
    let passphrase = cli.passphrase.unwrap_or_default();
    tracing::debug!("Using data directory {}", config.data.data_dir.display());

    // Pure computation, no storage needed
    if let Commands::Score { inputs } = &cli.command {
        return cmd_score(inputs, &config);
    }

    let store = DiaryStore::open(&config)?;

    // Safe on every start: does nothing once the marker exists
    if !matches!(cli.command, Commands::Migrate { .. } | Commands::Wipe) {
        let legacy = JsonFileLegacyStore::new(config.legacy_file());
        if let MigrationOutcome::Abandoned { reason } = migrate_from_legacy(&store, &legacy) {
            tracing::warn!("Legacy import postponed: {}", reason);
        }
    }

    match cli.command {
        Commands::Migrate { legacy_file } => {
            let path = legacy_file.unwrap_or_else(|| config.legacy_file());
            cmd_migrate(&store, &path)
        }
        Commands::Settings { action } => cmd_settings(&store, action, &passphrase),
        Commands::Log {
            date,
            inputs,
            period_start,
            no_period_start,
            absent,
        } => cmd_log(
            &store,
            &config,
            &passphrase,
            date,
            &inputs,
            match (period_start, no_period_start) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            },
            absent,
        ),
        Commands::Score { inputs } => cmd_score(&inputs, &config),
        Commands::Cycles { json } => cmd_cycles(&store, &config, &passphrase, json),
        Commands::Export { file } => cmd_export(&store, &passphrase, file.as_deref()),
        Commands::Import { file } => cmd_import(&store, &passphrase, &file),
        Commands::Wipe => cmd_wipe(&store),
    }
}

fn cmd_migrate(store: &DiaryStore, legacy_file: &Path) -> Result<ExitCode> {
    let legacy = JsonFileLegacyStore::new(legacy_file);

    match migrate_from_legacy(store, &legacy) {
        MigrationOutcome::AlreadyMigrated => {
            println!("Already migrated - nothing to do.");
        }
        MigrationOutcome::Migrated(report) if report.is_empty() => {
            println!("✓ Migration complete - no legacy data found.");
        }
        MigrationOutcome::Migrated(report) => {
            println!("✓ Migration complete");
            if report.settings {
                println!("  Settings imported");
            }
            if report.bundle {
                println!("  Encrypted entries imported");
            }
            if let Some(count) = report.entries {
                println!("  {} entries imported", count);
            }
        }
        MigrationOutcome::Abandoned { reason } => {
            eprintln!("Migration abandoned: {}", reason);
            eprintln!("It will be retried on the next run.");
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_settings(store: &DiaryStore, action: SettingsAction, passphrase: &str) -> Result<ExitCode> {
    let patch = match action {
        SettingsAction::Show => {
            print_settings(&store.load_settings())?;
            return Ok(ExitCode::SUCCESS);
        }
        SettingsAction::Set {
            quick_mode,
            encryption,
            kdf_strong,
            compact_pdf,
        } => SettingsPatch {
            quick_mode,
            encryption,
            kdf_strong,
            compact_pdf,
        },
    };

    let current = store.load_settings();
    let next = current.merged(&patch);
    let reseal = next.encryption != current.encryption
        || (next.encryption && next.kdf_strong != current.kdf_strong);

    if !reseal {
        print_settings(&store.save_settings(&patch)?)?;
        return Ok(ExitCode::SUCCESS);
    }

    // The stored entries must follow the new mode
    let loaded = store.load_entries(passphrase, &current)?;
    if loaded.locked {
        eprintln!("{}", LOCKED_MESSAGE);
        return Ok(ExitCode::FAILURE);
    }
    if next.encryption && !passphrase_is_usable(passphrase) {
        eprintln!("Enabling encryption needs a passphrase of at least 4 characters.");
        return Ok(ExitCode::FAILURE);
    }

    let saved = store.save_settings(&patch)?;
    let outcome = store.save_entries(&loaded.entries, passphrase, &saved)?;
    println!(
        "✓ Re-saved {} entries ({})",
        loaded.entries.len(),
        match outcome {
            SaveOutcome::Encrypted => "encrypted",
            SaveOutcome::Plain => "plaintext",
            SaveOutcome::Skipped => "skipped",
        }
    );
    print_settings(&saved)?;
    Ok(ExitCode::SUCCESS)
}

fn print_settings(settings: &SettingsRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

fn cmd_log(
    store: &DiaryStore,
    config: &Config,
    passphrase: &str,
    date: NaiveDate,
    inputs: &PbacArgs,
    period_start: Option<bool>,
    absent: Option<AbsentArg>,
) -> Result<ExitCode> {
    let settings = store.load_settings();
    let loaded = store.load_entries(passphrase, &settings)?;
    if loaded.locked {
        eprintln!("{}", LOCKED_MESSAGE);
        return Ok(ExitCode::FAILURE);
    }

    // Keep whatever else the day already holds
    let day = date.format("%Y-%m-%d").to_string();
    let mut entry = loaded
        .entries
        .into_iter()
        .find(|e| e.date == day)
        .unwrap_or_else(|| DailyEntry::new(date));

    let mut record = entry.pbac.take().unwrap_or_default();
    match absent {
        Some(reason) => record.mark_absent(reason.into()),
        None => inputs.apply(&mut record, &config.pbac),
    }
    if let Some(period_start) = period_start {
        record.period_start = period_start;
    }
    entry.pbac = Some(record);
    let score = entry.day_score();

    match store.upsert_entry(entry, passphrase, &settings)? {
        SaveOutcome::Skipped => {
            eprintln!("{}", SKIPPED_MESSAGE);
            Ok(ExitCode::FAILURE)
        }
        _ => {
            match score {
                Some(score) => println!("✓ Logged {}: PBAC {}", day, score),
                None => println!("✓ Logged {}: no score", day),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_score(inputs: &PbacArgs, config: &Config) -> Result<ExitCode> {
    let record = inputs.record(&config.pbac);
    println!("PBAC score: {}", record.day_score.unwrap_or(0));
    Ok(ExitCode::SUCCESS)
}

fn cmd_cycles(
    store: &DiaryStore,
    config: &Config,
    passphrase: &str,
    json: bool,
) -> Result<ExitCode> {
    let loaded = store.load_entries(passphrase, &store.load_settings())?;
    if loaded.locked {
        eprintln!("{}", LOCKED_MESSAGE);
        return Ok(ExitCode::FAILURE);
    }

    let flags = build_period_flags(&loaded.entries, &config.pbac);
    if json {
        println!("{}", serde_json::to_string_pretty(&flags.cycles)?);
        return Ok(ExitCode::SUCCESS);
    }

    if flags.cycles.is_empty() {
        println!("No bleeding cycles recorded.");
    }
    for (i, cycle) in flags.cycles.iter().enumerate() {
        println!(
            "Cycle {}: {} → {}  ({} days, PBAC {})",
            i + 1,
            cycle.start,
            cycle.end,
            cycle.len(),
            cycle.pbac_sum
        );
    }

    let isolated: Vec<String> = flags
        .spotting_set
        .iter()
        .filter(|d| !flags.cycles.iter().any(|c| c.start <= **d && **d <= c.end))
        .map(|d| d.to_string())
        .collect();
    if !isolated.is_empty() {
        println!("Spotting outside cycles: {}", isolated.join(", "));
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_export(store: &DiaryStore, passphrase: &str, file: Option<&Path>) -> Result<ExitCode> {
    let loaded = store.load_entries(passphrase, &store.load_settings())?;
    if loaded.locked {
        eprintln!("{}", LOCKED_MESSAGE);
        return Ok(ExitCode::FAILURE);
    }

    let text = endo_core::backup::export_json(&loaded.entries)?;
    match file {
        Some(path) => {
            std::fs::write(path, text)?;
            println!("✓ Exported {} entries to {}", loaded.entries.len(), path.display());
        }
        None => println!("{}", text),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_import(store: &DiaryStore, passphrase: &str, file: &Path) -> Result<ExitCode> {
    let settings = store.load_settings();

    // Never replace data this passphrase cannot read
    if store.load_entries(passphrase, &settings)?.locked {
        eprintln!("{}", LOCKED_MESSAGE);
        return Ok(ExitCode::FAILURE);
    }

    let text = std::fs::read_to_string(file)?;
    match store.import_backup(&text, passphrase, &settings)? {
        SaveOutcome::Skipped => {
            eprintln!("{}", SKIPPED_MESSAGE);
            Ok(ExitCode::FAILURE)
        }
        _ => {
            let count = store.load_entries(passphrase, &settings)?.entries.len();
            println!("✓ Imported {} entries from {}", count, file.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_wipe(store: &DiaryStore) -> Result<ExitCode> {
    store.clear_database()?;
    println!("✓ Deleted local database");
    Ok(ExitCode::SUCCESS)
}
