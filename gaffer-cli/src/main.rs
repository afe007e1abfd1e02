//! CLI entry point for the gaffer workflow engine.
//!
//! One positional argument: the development request. The repository root
//! defaults to the enclosing git root of the current directory. Exit codes
//! are stable: 0 complete, 1 failed (scope unsatisfied), 2 scope or engine
//! error, 130 external cancellation.

mod console;
mod logging;

use clap::Parser;
use gaffer::config::EngineConfig;
use gaffer::{Engine, Status};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

const EXIT_COMPLETE: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ENGINE_ERROR: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "gaffer",
    version,
    about = "Autonomous development-task orchestrator",
    after_help = "Examples:\n  gaffer \"Add a new resource type 'titanium' to the economy\"\n  gaffer --repo-root /path/to/repo \"Fix the negative population bug\""
)]
struct Cli {
    /// The development task to accomplish.
    request: String,

    /// Verbose output: agent prose, tool calls, debug-level diagnostics.
    #[arg(short, long)]
    verbose: bool,

    /// Cap on planner rounds across the whole workflow.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_iterations: Option<u64>,

    /// Tasks between periodic assessor reviews.
    #[arg(long, default_value_t = 5)]
    review_interval: u32,

    /// Repository root; defaults to the enclosing git root of `.`.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Role configuration file (JSON). Defaults to gaffer.json when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Walk upward from `start` to the nearest directory containing `.git`.
fn find_git_root(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".git").exists() {
            return dir;
        }
        if !dir.pop() {
            return start.to_path_buf();
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig, ExitCode> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(|err| {
            error!("{err}");
            ExitCode::from(EXIT_ENGINE_ERROR)
        })?,
        None => {
            let default_path = Path::new("gaffer.json");
            if default_path.exists() {
                EngineConfig::load(default_path).map_err(|err| {
                    error!("{err}");
                    ExitCode::from(EXIT_ENGINE_ERROR)
                })?
            } else {
                warn!("no config file found; using local default endpoint");
                EngineConfig::local_default()
            }
        }
    };
    config.review_interval = cli.review_interval;
    if cli.max_iterations.is_some() {
        config.max_iterations = cli.max_iterations;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let repo_root = if cli.repo_root == Path::new(".") {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        find_git_root(&cwd)
    } else {
        cli.repo_root.clone()
    };
    if !repo_root.exists() {
        error!("repository path does not exist: {}", repo_root.display());
        return ExitCode::from(EXIT_ENGINE_ERROR);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let engine = Engine::builder(&cli.request, &repo_root)
        .with_config(config)
        .build();
    console::attach(&engine.dispatcher(), cli.verbose);

    // SIGINT flips the cooperative flag; the engine stops at the next node
    // boundary and we report 130.
    let cancel = engine.cancellation_flag();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current node");
            cancel_for_signal.store(true, Ordering::SeqCst);
        }
    });

    info!(repo = %repo_root.display(), "starting workflow");
    match engine.run().await {
        Ok(state) => {
            if let Some(report) = &state.work_report {
                println!("\n{report}");
            }
            if cancel.load(Ordering::SeqCst) {
                return ExitCode::from(EXIT_CANCELLED);
            }
            match state.status {
                Status::Complete => ExitCode::from(EXIT_COMPLETE),
                _ => ExitCode::from(EXIT_FAILED),
            }
        }
        // ScopeError and unrecoverable engine failures both land here.
        Err(err) => {
            error!("{err}");
            ExitCode::from(EXIT_ENGINE_ERROR)
        }
    }
}
