use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::warn;

use liftload::calibration::CalibrationOutcome;
use liftload::config::AppConfig;
use liftload::logging::{init_logging, LogLevel};
use liftload::models::{ContextSample, MuscleGroup};
use liftload::muscle::{MuscleRecoveryState, RecoveryStatus};
use liftload::readiness::{ReadinessEngine, ReadinessSnapshot};
use liftload::sfr::{ExerciseEfficiency, SfrAnalyzer, SfrZone};
use liftload::store::{EventStore, LoggedSetRecord};
use liftload::workload::RiskZone;
use liftload::SqliteEventStore;

/// liftload - Resistance Training Readiness CLI
///
/// Tracks training load, fitness-fatigue state and per-muscle recovery from
/// logged strength sessions, and recommends how hard to train next.
#[derive(Parser)]
#[command(name = "liftload")]
#[command(author = "liftload Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Resistance training readiness CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the database path from the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import logged sets from a CSV file
    ///
    /// Columns: id (optional), user_id, session_id, exercise_id, performed_at, metadata
    Import {
        #[arg(short, long)]
        file: PathBuf,

        /// Skip the calibration pass after importing
        #[arg(long)]
        no_calibrate: bool,
    },

    /// Show readiness for a user
    Readiness {
        #[arg(short, long)]
        user: String,

        /// Evaluation time (RFC 3339, default now)
        #[arg(short, long)]
        at: Option<String>,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recovery of a single muscle
    Muscle {
        #[arg(short, long)]
        user: String,

        /// Muscle name, e.g. chest or hamstrings
        #[arg(short, long)]
        muscle: String,

        #[arg(short, long)]
        at: Option<String>,
    },

    /// Stimulus-to-fatigue ratio of each exercise in a session
    Efficiency {
        #[arg(short, long)]
        session: String,

        #[arg(long)]
        json: bool,
    },

    /// Recalibrate a user's recovery parameters
    Calibrate {
        #[arg(short, long)]
        user: String,
    },

    /// Record sleep, stress and soreness for a day
    Context {
        #[arg(short, long)]
        user: String,

        /// Day (YYYY-MM-DD)
        #[arg(short, long)]
        date: NaiveDate,

        #[arg(long)]
        sleep_hours: Option<f64>,

        #[arg(long)]
        sleep_quality: Option<u8>,

        #[arg(long)]
        stress: Option<u8>,

        #[arg(long)]
        nutrition: Option<u8>,

        #[arg(long)]
        soreness: Option<u8>,
    },

    /// Hide a session from all calculations
    DeleteSession {
        #[arg(short, long)]
        session: String,
    },

    /// Readiness and recent load trend for every known user
    Report {
        #[arg(short, long)]
        at: Option<String>,

        /// Days of trend to summarize
        #[arg(short, long, default_value_t = 28)]
        days: u32,
    },

    /// Show database statistics
    Status,

    /// Show or initialize the configuration file
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write the default configuration to disk
        #[arg(short, long)]
        init: bool,
    },
}

#[derive(Tabled)]
struct MuscleRow {
    #[tabled(rename = "Muscle")]
    muscle: String,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Fatigue")]
    fatigue: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Recovered by")]
    recovered_by: String,
}

impl From<&MuscleRecoveryState> for MuscleRow {
    fn from(state: &MuscleRecoveryState) -> Self {
        MuscleRow {
            muscle: state.muscle.to_string(),
            region: state.category.to_string(),
            fatigue: format!("{:.1}", state.fatigue_level),
            status: state.status.to_string(),
            recovered_by: state
                .estimated_full_recovery_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct EfficiencyRow {
    #[tabled(rename = "Exercise")]
    exercise: String,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Effective volume")]
    volume: String,
    #[tabled(rename = "Fatigue cost")]
    cost: String,
    #[tabled(rename = "SFR")]
    sfr: String,
    #[tabled(rename = "Zone")]
    zone: String,
}

impl From<&ExerciseEfficiency> for EfficiencyRow {
    fn from(e: &ExerciseEfficiency) -> Self {
        EfficiencyRow {
            exercise: e.exercise_id.clone(),
            time: e.performed_at.format("%H:%M").to_string(),
            volume: format!("{:.0}", e.effective_volume),
            cost: format!("{:.2}", e.fatigue_cost),
            sfr: format!("{:.1}", e.sfr),
            zone: e.zone.to_string(),
        }
    }
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Zone")]
    zone: String,
    #[tabled(rename = "ACWR")]
    ratio: String,
    #[tabled(rename = "Load delta")]
    delta: String,
    #[tabled(rename = "Mean ACWR")]
    mean_ratio: String,
    #[tabled(rename = "Spike days")]
    spikes: String,
    #[tabled(rename = "Training days")]
    training_days: String,
    #[tabled(rename = "Performance change")]
    performance: String,
}

fn parse_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("Invalid timestamp '{}', expected RFC 3339", s))
    })
    .transpose()
}

fn colored_zone(zone: RiskZone) -> ColoredString {
    match zone {
        RiskZone::HighRisk => zone.to_string().red().bold(),
        RiskZone::Caution => zone.to_string().yellow().bold(),
        RiskZone::Optimal => zone.to_string().green().bold(),
        RiskZone::Undertraining => zone.to_string().cyan().bold(),
        RiskZone::InsufficientData => zone.to_string().dimmed(),
    }
}

fn colored_status(status: RecoveryStatus) -> ColoredString {
    match status {
        RecoveryStatus::Ready => status.to_string().green(),
        RecoveryStatus::PartiallyRecovered => status.to_string().yellow(),
        RecoveryStatus::NotReady => status.to_string().red(),
    }
}

fn read_records(path: &Path) -> Result<Vec<LoggedSetRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    reader
        .deserialize()
        .enumerate()
        .map(|(row, record)| record.with_context(|| format!("Malformed CSV row {}", row + 2)))
        .collect()
}

async fn import(engine: &ReadinessEngine<SqliteEventStore>, file: &Path, calibrate: bool) -> Result<()> {
    println!("{}", "Importing logged sets...".green().bold());
    let records = read_records(file)?;

    let mut sessions: BTreeMap<String, Vec<LoggedSetRecord>> = BTreeMap::new();
    for record in records {
        sessions.entry(record.session_id.clone()).or_default().push(record);
    }

    let pb = ProgressBar::new(sessions.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({msg})")?
            .progress_chars("#>-"),
    );

    let mut imported = 0usize;
    let mut rejected = 0usize;
    let mut users = Vec::new();

    for (session_id, records) in &sessions {
        pb.set_message(format!("Session {}", session_id));

        match engine.ingest_session(records).await {
            Ok(summary) => {
                imported += summary.events;
                users.extend(summary.users);
            }
            Err(e) => {
                rejected += 1;
                pb.println(format!("{} session {}: {}", "✗".red(), session_id, e.user_message()));
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    println!(
        "{} Imported {} events from {} sessions ({} rejected)",
        "✓".green(),
        imported,
        sessions.len() - rejected,
        rejected
    );

    if calibrate {
        users.sort();
        users.dedup();
        for user in users {
            let outcome = engine.calibrate(&user).await?;
            print_calibration(&user, &outcome);
        }
    }

    Ok(())
}

fn print_readiness(snapshot: &ReadinessSnapshot) {
    println!(
        "{} {} at {}",
        "Readiness for".bold(),
        snapshot.user_id.bold(),
        snapshot.as_of.format("%Y-%m-%d %H:%M UTC")
    );

    if snapshot.degraded {
        println!("{}", "  Store unavailable; showing last known state".yellow());
    }

    let Some(score) = snapshot.score else {
        println!("  {}", "No training history yet".dimmed());
        return;
    };

    println!("  Score:       {}", score.to_string().bold());
    println!("  Zone:        {}", colored_zone(snapshot.zone));
    match snapshot.acwr_ratio {
        Some(ratio) => println!("  ACWR:        {:.2} ({})", ratio, snapshot.acwr_zone),
        None => println!("  ACWR:        {}", "insufficient history".dimmed()),
    }
    println!(
        "  Fitness:     {:.2}  Fatigue: {:.2}  Performance: {:.2}",
        snapshot.fitness, snapshot.fatigue, snapshot.performance
    );
    println!("  Load change: {:+}%", snapshot.load_delta_pct);
    for (category, modifier) in &snapshot.category_modifiers {
        println!("  {} load:  x{:.2}", category, modifier);
    }

    if !snapshot.muscles.is_empty() {
        let rows: Vec<MuscleRow> = snapshot.muscles.iter().map(MuscleRow::from).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
}

fn print_calibration(user: &str, outcome: &CalibrationOutcome) {
    match outcome {
        CalibrationOutcome::Updated(report) => {
            let p = &report.parameters;
            println!(
                "{} {}: upper {:.1} h, lower {:.1} h, resistance {:.1} (confidence {:.2}, {} sessions)",
                "✓".green(),
                user,
                p.upper_recovery_hours,
                p.lower_recovery_hours,
                p.fatigue_resistance,
                p.confidence,
                p.session_count
            );
        }
        CalibrationOutcome::Skipped { sessions, required } => {
            println!(
                "{} {}: {} of {} sessions needed before calibrating",
                "-".dimmed(),
                user,
                sessions,
                required
            );
        }
        CalibrationOutcome::Stale { reason } => {
            println!("{} {}: calibration failed ({})", "!".yellow(), user, reason);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.logging.level = LogLevel::Warn.raised_by(cli.verbose);
    init_logging(&config.logging)?;

    if let Commands::Config { show, init } = &cli.command {
        if *init {
            let path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
            config.save_to_file(&path)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
        if *show || !*init {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        return Ok(());
    }

    let database_path = cli.database.clone().unwrap_or_else(|| config.database_path.clone());
    let store = Arc::new(SqliteEventStore::open(&database_path)?);

    // Calibration is run explicitly so the process does not exit mid-run
    let mut engine_config = config.engine.clone();
    engine_config.calibrate_on_ingest = false;
    let engine = ReadinessEngine::new(Arc::clone(&store), engine_config);

    match cli.command {
        Commands::Import { file, no_calibrate } => {
            import(&engine, &file, !no_calibrate).await?;
        }

        Commands::Readiness { user, at, json } => {
            let snapshot = engine.get_readiness(&user, parse_time(at.as_deref())?).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_readiness(&snapshot);
            }
        }

        Commands::Muscle { user, muscle, at } => {
            let muscle: MuscleGroup = muscle.parse()?;
            let state = engine
                .get_muscle_recovery(&user, muscle, parse_time(at.as_deref())?)
                .await?;

            println!(
                "{}: {:.1} fatigue, {}",
                state.muscle.to_string().bold(),
                state.fatigue_level,
                colored_status(state.status)
            );
            if let Some(at) = state.estimated_full_recovery_at {
                println!("  Fully recovered by {}", at.format("%Y-%m-%d %H:%M UTC"));
            }
        }

        Commands::Efficiency { session, json } => {
            let efficiencies = engine.get_exercise_efficiency(&session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&efficiencies)?);
            } else if efficiencies.is_empty() {
                println!("{}", "No exercises found for that session".dimmed());
            } else {
                let rows: Vec<EfficiencyRow> = efficiencies.iter().map(EfficiencyRow::from).collect();
                println!("{}", Table::new(rows).with(Style::rounded()));

                let analyzer = SfrAnalyzer::with_components(
                    config.engine.sfr.clone(),
                    Default::default(),
                    Default::default(),
                );
                let summary = analyzer.summarize(&efficiencies);
                if let Some(mean) = summary.mean_sfr {
                    println!("  Mean SFR: {:.1}", mean);
                }
                for e in efficiencies.iter().filter(|e| e.zone == SfrZone::JunkVolume) {
                    println!("  {} {} is junk volume; consider a substitute", "!".yellow(), e.exercise_id);
                }
            }
        }

        Commands::Calibrate { user } => {
            let outcome = engine.calibrate(&user).await?;
            print_calibration(&user, &outcome);
        }

        Commands::Context {
            user,
            date,
            sleep_hours,
            sleep_quality,
            stress,
            nutrition,
            soreness,
        } => {
            let mut sample = ContextSample::empty(user, date);
            sample.sleep_hours = sleep_hours;
            sample.sleep_quality = sleep_quality;
            sample.stress = stress;
            sample.nutrition_quality = nutrition;
            sample.soreness = soreness;

            engine.ingest_context(sample).await?;
            println!("{} Context recorded for {}", "✓".green(), date);
        }

        Commands::DeleteSession { session } => {
            let hidden = engine.delete_session(&session).await?;
            println!("{} Hid {} events from session {}", "✓".green(), hidden, session);
        }

        Commands::Report { at, days } => {
            let as_of = parse_time(at.as_deref())?.unwrap_or_else(Utc::now);
            let users = store.list_users()?;
            let dash = || "-".to_string();

            let mut rows = Vec::with_capacity(users.len());
            for (user, result) in engine.batch_readiness(&users, as_of) {
                let mut row = match result {
                    Ok(s) => ReportRow {
                        user: user.clone(),
                        score: s.score.map(|v| v.to_string()).unwrap_or_else(dash),
                        zone: s.zone.to_string(),
                        ratio: s.acwr_ratio.map(|r| format!("{:.2}", r)).unwrap_or_else(dash),
                        delta: format!("{:+}%", s.load_delta_pct),
                        mean_ratio: dash(),
                        spikes: dash(),
                        training_days: dash(),
                        performance: dash(),
                    },
                    Err(e) => ReportRow {
                        user: user.clone(),
                        score: "error".to_string(),
                        zone: e.user_message(),
                        ratio: dash(),
                        delta: dash(),
                        mean_ratio: dash(),
                        spikes: dash(),
                        training_days: dash(),
                        performance: dash(),
                    },
                };

                match engine.get_load_trend(&user, Some(as_of), days).await {
                    Ok(trend) => {
                        row.mean_ratio = trend.mean_ratio.map(|r| format!("{:.2}", r)).unwrap_or_else(dash);
                        row.spikes = trend.spike_days.to_string();
                        row.training_days = format!("{}/{}", trend.training_days(), trend.windows.len());
                        row.performance = trend
                            .performance_change()
                            .map(|p| format!("{:+.2}", p))
                            .unwrap_or_else(dash);
                    }
                    Err(e) => warn!(user_id = %user, error = %e, "Load trend unavailable"),
                }

                rows.push(row);
            }

            println!("Last {} days to {}", days, as_of.format("%Y-%m-%d"));
            println!("{}", Table::new(rows).with(Style::rounded()));
        }

        Commands::Status => {
            let stats = store.stats()?;
            println!("{}", "Database status".bold());
            println!("  Path:             {}", database_path.display());
            println!("  Users:            {}", stats.user_count);
            println!("  Events:           {}", stats.event_count);
            println!("  Deleted events:   {}", stats.tombstoned_event_count);
            println!("  Context samples:  {}", stats.context_sample_count);
            println!("  Snapshots:        {}", stats.snapshot_count);
        }

        Commands::Config { .. } => {}
    }

    Ok(())
}
