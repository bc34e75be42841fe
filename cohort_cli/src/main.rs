use clap::{Parser, Subcommand, ValueEnum};
use cohort_core::store::{load_cohort_csv, load_indexed_cohort_csv};
use cohort_core::*;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Clinical visit consolidation and scale aggregation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Count distinct encounters per patient and utilization label
    Utilization {
        /// Cohort CSV (person_id,start_date,end_date; or person_id,index_date with --window)
        #[arg(long)]
        cohort: PathBuf,

        /// Visit extract CSV
        #[arg(long)]
        visits: PathBuf,

        /// Schema version (defaults to the configured version)
        #[arg(long = "data-version")]
        data_version: Option<String>,

        /// Utilization label, NAME=TYPE[;TYPE...] (repeatable)
        #[arg(long = "label")]
        labels: Vec<UtilizationLabel>,

        /// Drop encounters flagged as failed
        #[arg(long)]
        exclude_failed: bool,

        /// Relative window FROM:TO in days around each index date
        #[arg(long, allow_hyphen_values = true)]
        window: Option<RelativeWindow>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Aggregate scale readings per patient, or per day with change tracking
    Aggregate {
        /// Measurement extract CSV
        #[arg(long)]
        measurements: PathBuf,

        /// Scale name (CGI-S, CGI-I, GAF)
        #[arg(long)]
        scale: String,

        /// Schema version (defaults to the configured version)
        #[arg(long = "data-version")]
        data_version: Option<String>,

        /// Comma-separated patient ids
        #[arg(
            long,
            value_delimiter = ',',
            conflicts_with = "cohort",
            required_unless_present = "cohort"
        )]
        patients: Vec<i64>,

        /// Cohort CSV (person_id,start_date,end_date; or person_id,index_date with --window)
        #[arg(long)]
        cohort: Option<PathBuf>,

        /// Relative window FROM:TO in days around each index date
        #[arg(long, requires = "cohort", allow_hyphen_values = true)]
        window: Option<RelativeWindow>,

        /// Aggregation policy (defaults to the configured policy)
        #[arg(long)]
        policy: Option<String>,

        /// Aggregate per day and report changes between readings
        #[arg(long)]
        change: bool,

        /// Drop readings from failed encounters
        #[arg(long)]
        exclude_failed: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Days of observation before and after each index date
    DaysAvailable {
        /// Cohort CSV (person_id,index_date)
        #[arg(long)]
        cohort: PathBuf,

        /// Observation period CSV
        #[arg(long)]
        observations: PathBuf,

        /// Schema version (defaults to the configured version)
        #[arg(long = "data-version")]
        data_version: Option<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct OutputArgs {
    /// Write results here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    cohort_core::logging::init_with_level(cohort_core::logging::level_for_verbosity(cli.verbose));

    let config_path = cli.config.clone().unwrap_or_else(Config::default_config_path);

    if let Commands::InitConfig { force } = cli.command {
        return cmd_init_config(&config_path, force);
    }

    let config = if cli.config.is_some() || config_path.exists() {
        Config::load_from(&config_path)?
    } else {
        Config::load()?
    };
    tracing::debug!("Default schema version {}", config.default_version);

    match cli.command {
        Commands::Utilization {
            cohort,
            visits,
            data_version,
            labels,
            exclude_failed,
            window,
            output,
        } => cmd_utilization(
            &config,
            &cohort,
            &visits,
            data_version.as_deref(),
            labels,
            exclude_failed,
            window,
            &output,
        ),
        Commands::Aggregate {
            measurements,
            scale,
            data_version,
            patients,
            cohort,
            window,
            policy,
            change,
            exclude_failed,
            output,
        } => {
            let subject = load_subject(patients, cohort.as_deref(), window)?;
            cmd_aggregate(
                &config,
                &measurements,
                &scale,
                data_version.as_deref(),
                &subject,
                policy.as_deref(),
                change,
                exclude_failed,
                &output,
            )
        }
        Commands::DaysAvailable {
            cohort,
            observations,
            data_version,
            output,
        } => cmd_days_available(&config, &cohort, &observations, data_version.as_deref(), &output),
        Commands::InitConfig { .. } => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_utilization(
    config: &Config,
    cohort_path: &Path,
    visits_path: &Path,
    version: Option<&str>,
    labels: Vec<UtilizationLabel>,
    exclude_failed: bool,
    window: Option<RelativeWindow>,
    output: &OutputArgs,
) -> Result<()> {
    let label_map = if labels.is_empty() {
        config.label_map()?
    } else {
        VisitLabelMap::new(labels)?
    };

    let cohort = match window {
        Some(window) => VisitCohort::Windowed {
            members: load_indexed_cohort_csv(cohort_path)?,
            window,
        },
        None => VisitCohort::Batch(load_cohort_csv(cohort_path)?),
    };

    let mut store = MemoryStore::new();
    store.load_visits_csv(visits_path)?;

    let request = UtilizationRequest {
        cohort: &cohort,
        version: version.unwrap_or(&config.default_version),
        labels: Some(&label_map),
        include_failed: if exclude_failed { Some(false) } else { None },
    };
    let outcome = consolidate_visit_utilization(&store, config, &request)?;
    report_diagnostics(&outcome.diagnostics);

    let names = label_map.names();
    emit(output, outcome.rows.len(), &outcome.rows, |out| {
        cohort_core::export::write_utilization_csv(out, &names, &outcome.rows)
    })
}

fn load_subject(
    patients: Vec<i64>,
    cohort: Option<&Path>,
    window: Option<RelativeWindow>,
) -> Result<MeasurementSubject> {
    match (cohort, window) {
        (Some(path), Some(window)) => Ok(MeasurementSubject::Indexed {
            members: load_indexed_cohort_csv(path)?,
            window,
        }),
        (Some(path), None) => Ok(MeasurementSubject::Cohort(load_cohort_csv(path)?)),
        (None, _) => Ok(MeasurementSubject::Patients(
            patients.into_iter().map(PatientId::new).collect::<Result<Vec<_>>>()?,
        )),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_aggregate(
    config: &Config,
    measurements_path: &Path,
    scale: &str,
    version: Option<&str>,
    subject: &MeasurementSubject,
    policy: Option<&str>,
    change: bool,
    exclude_failed: bool,
    output: &OutputArgs,
) -> Result<()> {
    let mut store = MemoryStore::new();
    store.load_measurements_csv(measurements_path)?;

    let request = MeasurementRequest {
        scale,
        version: version.unwrap_or(&config.default_version),
        subject,
        policy: policy.unwrap_or(&config.measurements.policy),
        change_tracking: change,
        include_failed: !exclude_failed,
        dbname: None,
    };
    let outcome = aggregate_measurements(&store, config, &request)?;
    report_diagnostics(&outcome.diagnostics);

    match &outcome.rows {
        AggregationOutput::Summary(rows) => emit(output, rows.len(), rows, |out| {
            cohort_core::export::write_aggregates_csv(out, rows)
        }),
        AggregationOutput::Changes(deltas) => emit(output, deltas.len(), deltas, |out| {
            cohort_core::export::write_deltas_csv(out, deltas)
        }),
    }
}

fn cmd_days_available(
    config: &Config,
    cohort_path: &Path,
    observations_path: &Path,
    version: Option<&str>,
    output: &OutputArgs,
) -> Result<()> {
    let members = load_indexed_cohort_csv(cohort_path)?;

    let mut store = MemoryStore::new();
    store.load_observation_periods_csv(observations_path)?;

    let version = version.unwrap_or(&config.default_version);
    let outcome = days_available(&store, config, &members, version)?;
    report_diagnostics(&outcome.diagnostics);

    emit(output, outcome.rows.len(), &outcome.rows, |out| {
        cohort_core::export::write_days_available_csv(out, &outcome.rows)
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }

    Config::default().save_to(path)?;
    println!("✓ Wrote default config to {}", path.display());
    Ok(())
}

fn report_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        eprintln!("warning: {}", diagnostic);
    }
}

/// Write rows as CSV (via `write_csv`) or JSON to the chosen destination
fn emit<T, F>(output: &OutputArgs, count: usize, rows: &T, write_csv: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let mut out: Box<dyn Write> = match &output.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };

    match output.format {
        Format::Csv => write_csv(&mut *out)?,
        Format::Json => {
            serde_json::to_writer_pretty(&mut out, rows)?;
            writeln!(out)?;
        }
    }
    out.flush()?;

    if let Some(path) = &output.output {
        println!("✓ Wrote {} rows to {}", count, path.display());
    }
    Ok(())
}
