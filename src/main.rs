//! Command-line front end for the driving exam statistics store.

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anyhow::Context;
use driving_exams_lib::commands::{self, parse_period_arg, CommandResponse};
use driving_exams_lib::config::{load_config, resolve_db_path, DB_PATH_ENV};
use driving_exams_lib::{ExamFilter, ExamStore};

#[derive(Parser)]
#[command(name = "driving-exams")]
#[command(version)]
#[command(about = "Import driving exam statistics and query them with filters")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the database file
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Path to the settings file (defaults to ./driving-exams.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a delimited file, or every .csv/.txt file under a directory
    Import { path: PathBuf },

    /// Parse a file and show what would be imported, without touching the store
    Preview { path: PathBuf },

    /// List matching records with the derived presented column
    Table {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Passed/failed totals per exam type
    Aggregate {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Distinct values of a text field (province, exam_center, driving_school, exam_type, permit)
    Values { field: String },

    /// Years present in the store
    Years,

    /// Periods recorded in the import ledger
    Periods,

    /// Store and build information
    Status,

    /// Write a printable report (or CSV with --csv) of the filtered table
    Report {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Write the table as CSV instead of a paginated text report
        #[arg(long)]
        csv: bool,

        /// Report title
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Province contains (case-insensitive)
    #[arg(long)]
    province: Option<String>,

    /// Exam center contains
    #[arg(long)]
    exam_center: Option<String>,

    /// Driving school name contains
    #[arg(long)]
    driving_school: Option<String>,

    /// Exam type contains
    #[arg(long)]
    exam_type: Option<String>,

    /// Permit contains
    #[arg(long)]
    permit: Option<String>,

    /// First period, YYYY-MM (needs --to)
    #[arg(long)]
    from: Option<String>,

    /// Last period, YYYY-MM (needs --from)
    #[arg(long)]
    to: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> driving_exams_lib::Result<ExamFilter> {
        Ok(ExamFilter {
            province: self.province,
            exam_center: self.exam_center,
            driving_school: self.driving_school,
            exam_type: self.exam_type,
            permit: self.permit,
            from_period: self.from.as_deref().map(parse_period_arg).transpose()?,
            to_period: self.to.as_deref().map(parse_period_arg).transpose()?,
        })
    }
}

fn run(cli: Cli) -> anyhow::Result<Value> {
    let config = load_config(cli.config.as_deref())?;
    let db_path = resolve_db_path(
        cli.database.as_deref(),
        std::env::var(DB_PATH_ENV).ok(),
        &config,
    );
    let open_store = || {
        ExamStore::open(&db_path)
            .with_context(|| format!("failed to open database {}", db_path.display()))
    };

    let payload = match cli.command {
        Commands::Preview { path } => commands::preview_command(&path)?,
        Commands::Import { path } => commands::import_command(&mut open_store()?, &path)?,
        Commands::Table { filter } => {
            commands::table_command(&open_store()?, &filter.into_filter()?)?
        }
        Commands::Aggregate { filter } => {
            commands::aggregate_command(&open_store()?, &filter.into_filter()?)?
        }
        Commands::Values { field } => commands::values_command(&open_store()?, &field)?,
        Commands::Years => commands::years_command(&open_store()?)?,
        Commands::Periods => commands::periods_command(&open_store()?)?,
        Commands::Status => commands::status_command(&open_store()?)?,
        Commands::Report {
            output,
            csv,
            title,
            filter,
        } => {
            let mut layout = config.report.clone();
            if let Some(title) = title {
                layout.title = title;
            }
            let filter = filter.into_filter()?;
            commands::report_command(&open_store()?, &filter, &layout, &output, csv)?
        }
    };
    Ok(payload)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let (response, code) = match run(cli) {
        Ok(payload) => (CommandResponse::Success { payload }, ExitCode::SUCCESS),
        Err(err) => {
            let kind = err
                .downcast_ref::<driving_exams_lib::Error>()
                .map(|e| e.kind())
                .unwrap_or("UNKNOWN_ERROR");
            tracing::error!(error = %format!("{err:#}"), "command failed");
            (
                CommandResponse::error(kind, format!("{err:#}")),
                ExitCode::FAILURE,
            )
        }
    };

    match serde_json::to_string_pretty(&response) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            eprintln!("failed to serialize response: {err}");
            return ExitCode::FAILURE;
        }
    }
    code
}
