use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use udise_adapters::SourceFile;
use udise_core::AcademicYear;
use udise_storage::{PgGateway, MIGRATOR};
use udise_sync::{
    build_engine, report::recent_reports_markdown, write_csv, EventLog, EventSink, HeaderMode,
    SyncConfig, SyncEngine,
};

#[derive(Debug, Parser)]
#[command(name = "udise-cli")]
#[command(about = "UDISE+ school data sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct YearArgs {
    /// Academic year label, e.g. 2023-24
    #[arg(long)]
    year: String,
    /// Source API year id; looked up from the year list when omitted
    #[arg(long)]
    year_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List academic years offered by the source API
    Years,
    /// Parse a file, filter stored schools and preview a sample
    Analyze {
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        year: YearArgs,
        /// Write the preview sample as CSV
        #[arg(long)]
        sample_csv: Option<PathBuf>,
    },
    /// Analyze a file and sync every pending school
    Sync {
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        year: YearArgs,
    },
    /// Run the JSON control API
    Serve,
    /// Apply database migrations to DATABASE_URL
    Migrate,
    /// Print an index of recent run reports
    Reports {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Years => {
            let engine = engine_from_env().await?;
            for year in engine.academic_years().await? {
                println!("{}\t{}", year.year_id, year.year_desc);
            }
        }
        Commands::Analyze {
            file,
            year,
            sample_csv,
        } => {
            let engine = engine_from_env().await?;
            let year = resolve_year(&engine, year).await?;
            let source = SourceFile::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report = engine.analyze(&source, year).await?;
            println!(
                "analysis: unique={} stored={} pending={} sample={} sample_failures={}",
                report.total_identifiers,
                report.skipped_duplicates,
                report.pending.len(),
                report.sample.len(),
                report.sample_failures.len()
            );
            if let Some(path) = sample_csv {
                let out = std::fs::File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                write_csv(&report.sample, HeaderMode::FirstRecord, out)?;
                println!("sample written to {}", path.display());
            }
        }
        Commands::Sync { file, year } => {
            let engine = engine_from_env().await?;
            let engine = Arc::new(engine);
            let year = resolve_year(&engine, year).await?;
            let source = SourceFile::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report = engine.analyze(&source, year).await?;
            if !report.ready_to_sync() {
                println!("nothing to sync: all {} schools already stored", report.skipped_duplicates);
                return Ok(());
            }

            let canceller = engine.clone();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if let Err(err) = canceller.cancel() {
                        tracing::warn!(error = %err, "cancel ignored");
                    }
                }
            });
            let summary = engine.confirm().await;
            interrupt.abort();
            let summary = summary?;
            println!(
                "sync {}: run_id={} saved={} failed={} lost={} pending={}",
                summary.outcome,
                summary.run_id,
                summary.saved,
                summary.failed,
                summary.lost_records,
                summary.pending
            );
        }
        Commands::Serve => {
            udise_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let gateway = PgGateway::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?;
            MIGRATOR
                .run(gateway.pool())
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Reports { runs } => {
            let config = SyncConfig::from_env()?;
            let Some(dir) = config.reports_dir else {
                bail!("run reports are disabled (UDISE_REPORTS_DIR=off)");
            };
            println!("{}", recent_reports_markdown(&dir, runs)?);
        }
    }

    Ok(())
}

/// Events reach the terminal through the log's `tracing` mirror.
async fn engine_from_env() -> Result<SyncEngine> {
    let config = SyncConfig::from_env()?;
    let events: Arc<dyn EventSink> = Arc::new(EventLog::with_capacity(config.tuning.log_capacity));
    build_engine(&config, events).await
}

async fn resolve_year(engine: &SyncEngine, args: YearArgs) -> Result<AcademicYear> {
    if let Some(year_id) = args.year_id {
        return Ok(AcademicYear::new(year_id, args.year));
    }
    engine
        .academic_years()
        .await?
        .into_iter()
        .find(|y| y.year_desc == args.year)
        .with_context(|| format!("academic year '{}' not offered by the source API", args.year))
}
