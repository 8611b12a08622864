//! Conveyor CLI.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Minimal CI pipeline orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventKind {
    Push,
    #[value(name = "pull_request", alias = "pull-request")]
    PullRequest,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate triggers and execute the pipeline for an event
    Run {
        /// Path to the pipeline configuration
        #[arg(long, default_value = "conveyor.kdl")]
        config: String,
        /// Event kind
        #[arg(long, value_enum)]
        event: EventKind,
        /// Ref the event targets (branch for push, target branch for PRs)
        #[arg(long = "ref")]
        r#ref: String,
        /// Source branch for pull-request events
        #[arg(long)]
        source_ref: Option<String>,
        /// Maximum number of jobs running at once
        #[arg(long, default_value = "4")]
        concurrency: usize,
        /// Repository URL, overriding the configuration
        #[arg(long)]
        repo: Option<String>,
        /// Cache store directory
        #[arg(long, default_value = ".conveyor/cache")]
        cache_dir: PathBuf,
    },
    /// Validate a pipeline configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "conveyor.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CONVEYOR_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 0: run succeeded (or no trigger matched)
    // 1: run failed or was cancelled
    // 2: configuration error
    let code = match cli.command {
        Commands::Run {
            config,
            event,
            r#ref,
            source_ref,
            concurrency,
            repo,
            cache_dir,
        } => {
            commands::run::run(commands::run::RunArgs {
                config,
                event,
                r#ref,
                source_ref,
                concurrency,
                repo,
                cache_dir,
            })
            .await?
        }
        Commands::Validate { path } => commands::validate(&path),
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
