use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use scribe::checkpoint;
use scribe::config::{Config, DEFAULT_OUT_DIR, DEFAULT_WORD_LIMIT};
use scribe::pipeline::{Orchestrator, PipelineContext};
use scribe::progress::{EVENT_USER_PROGRESS, ProgressBus};
use scribe::server;
use scribe::state::PipelineState;
use scribe::wordcount::count_words;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(version, about = "AI-powered research report pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output directory for checkpoints, logs and reports
    #[arg(long, global = true, default_value = DEFAULT_OUT_DIR)]
    pub out_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the report pipeline once
    Run {
        /// The report query (required unless --resume finds a checkpoint)
        #[arg(short, long)]
        query: Option<String>,

        /// Checkpoint path (defaults to <out-dir>/checkpoint.json)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Resume from the checkpoint instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Target report length in words
        #[arg(long, default_value_t = DEFAULT_WORD_LIMIT)]
        word_limit: u32,
    },
    /// Start the HTTP run server
    Serve {
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_filter = if verbose { "scribe=debug" } else { "scribe=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::from_env(cli.out_dir.clone());

    match cli.command {
        Commands::Run {
            query,
            checkpoint,
            resume,
            word_limit,
        } => cmd_run(config, query, checkpoint, resume, word_limit).await,
        Commands::Serve { port, dev } => {
            server::start_server(server::default_app_state(config), port, dev).await
        }
    }
}

async fn cmd_run(
    config: Config,
    query: Option<String>,
    checkpoint_path: Option<PathBuf>,
    resume: bool,
    word_limit: u32,
) -> Result<()> {
    config.ensure_directories()?;
    let checkpoint_path = checkpoint_path.unwrap_or_else(|| config.checkpoint_path.clone());

    let initial_state = if resume && checkpoint_path.exists() {
        println!(
            "{} {}",
            style("Resuming from").dim(),
            checkpoint_path.display()
        );
        checkpoint::load(&checkpoint_path).context("Failed to restore checkpoint")?
    } else {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            bail!("--query is required unless --resume finds an existing checkpoint");
        };
        PipelineState::new(query, word_limit)
    };

    let bus = ProgressBus::new(config.progress_log.clone());
    spawn_progress_printer(&bus);

    let app_state = server::default_app_state(config.clone());
    let ctx = PipelineContext {
        generator: Arc::clone(&app_state.generator),
        search: Arc::clone(&app_state.search),
        bus,
        config,
    };

    println!("{} {}", style("Query:").bold(), initial_state.user_query);
    let orchestrator = Orchestrator::new(ctx);
    let final_state = orchestrator
        .run(initial_state, |stage, state| {
            if let Err(err) = checkpoint::save(state, &checkpoint_path) {
                tracing::warn!(error = %err, stage = %stage, "checkpoint save failed");
            }
        })
        .await;

    print_summary(&final_state);
    Ok(())
}

fn spawn_progress_printer(bus: &ProgressBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) if record.event == EVENT_USER_PROGRESS => {
                    if let Some(message) = record.message {
                        println!("  {} {}", style(">").cyan().bold(), message);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
}

fn print_summary(state: &PipelineState) {
    println!();
    match &state.error_message {
        Some(message) => {
            println!("{} {}", style("Run failed:").red().bold(), message);
        }
        None => {
            println!("{}", style("Run complete").green().bold());
        }
    }
    println!(
        "  status: {}  revisions: {}",
        state.validation_status, state.revision_count
    );
    if let Some(report) = &state.final_report {
        println!(
            "  report: {} words (target {})",
            count_words(report),
            state.word_limit
        );
    }
    if let Some(elapsed) = state.processing_time {
        println!("  elapsed: {elapsed:.1}s");
    }
    for warning in &state.warnings {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
    if let Some(files) = state
        .quality_metrics
        .get("saved_files")
        .and_then(|v| v.as_array())
    {
        for file in files {
            if let Some(path) = file.as_str() {
                println!("  saved: {path}");
            }
        }
    }
}
