use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crosscut::config::Config;
use crosscut::episode::EpisodeStatus;
use crosscut::pipeline::{Orchestrator, RunRequest};

#[derive(Parser)]
#[command(name = "crosscut", version)]
#[command(about = "Podcast post-production pipeline")]
struct Cli {
    /// Path to config.toml (defaults to ./config.toml, missing file uses defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline over a recording, or a stage subset over an existing episode
    Run {
        /// Raw media directory or file from the recorder
        #[arg(long)]
        source_path: Option<PathBuf>,

        /// Existing episode to resume or partially re-run
        #[arg(long)]
        episode_id: Option<String>,

        /// Comma-separated stage names; omit for the full pipeline
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
    },

    /// Run a single stage against an existing episode
    Stage {
        name: String,

        #[arg(long)]
        episode_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::load(cli.config.as_deref())?);
    let orchestrator = Orchestrator::new(config);

    // First Ctrl-C stops dispatching new stages; in-flight work finishes.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight stages");
            signal_token.cancel();
        }
    });

    let request = match cli.command {
        Command::Run {
            source_path,
            episode_id,
            stages,
        } => RunRequest {
            source_path,
            episode_id,
            stages,
        },
        Command::Stage { name, episode_id } => RunRequest {
            source_path: None,
            episode_id: Some(episode_id),
            stages: vec![name],
        },
    };

    let episode = orchestrator.run(request, cancel).await?;

    println!("episode:   {}", episode.episode_id);
    println!("status:    {}", episode.status.as_str());
    let completed: Vec<String> = episode
        .pipeline
        .stages_completed
        .iter()
        .map(|s| s.to_string())
        .collect();
    println!("completed: {}", completed.join(", "));
    for (stage, err) in &episode.pipeline.errors {
        eprintln!("error [{}]: {}", stage, err);
    }

    if episode.status == EpisodeStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}
