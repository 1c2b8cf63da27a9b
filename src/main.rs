use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use momo_etl::config::PipelineConfig;
use momo_etl::logging;
use momo_etl::pipeline::runner::{PipelineRunner, RunState};

#[derive(Parser)]
#[command(name = "momo-etl")]
#[command(about = "Mobile-money SMS batch ETL: parse, normalize, categorize, load")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over one XML export
    Run {
        /// Path to the XML input file
        #[arg(long)]
        input: PathBuf,
        /// Path to the SQLite database
        #[arg(long, default_value = "data/momo.sqlite3")]
        db: PathBuf,
        /// Optional TOML rule configuration; stock rules are used if absent
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the run manifest (default: next to the database)
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Where to write the dashboard snapshot (default: next to the database)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    logging::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            db,
            config,
            manifest,
            snapshot,
        } => {
            let config = match config {
                Some(path) => match PipelineConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "could not load config");
                        return ExitCode::FAILURE;
                    }
                },
                None => PipelineConfig::default(),
            };

            let runner = PipelineRunner::new(config, input, db, manifest, snapshot);
            match runner.run() {
                Ok(manifest) if manifest.state == RunState::Done => {
                    info!("run finished");
                    println!(
                        "done: {} parsed, {} inserted, {} duplicate, {} rejected, {} filtered, {} dead-lettered",
                        manifest.counts.parsed,
                        manifest.counts.inserted,
                        manifest.counts.duplicate,
                        manifest.counts.rejected,
                        manifest.counts.filtered,
                        manifest.counts.dead_lettered,
                    );
                    ExitCode::SUCCESS
                }
                Ok(manifest) => {
                    error!(state = ?manifest.state, "run did not complete");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    error!(error = %e, "pipeline failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
