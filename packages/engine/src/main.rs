// packages/engine/src/main.rs
//! Agentnet batch runner
//!
//! Imports an experiments file into a project, plays everything across the
//! worker pool and waits for the manager to drain.
//!
//! Exit codes: 0 when every experiment reached Finished, 1 when at least
//! one ended Invalid, 2 when the configuration or the experiments file was
//! rejected outright.

use agentnet_engine::runtime::ExpStatus;
use agentnet_engine::{App, EngineConfig, VERSION};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agentnet", version, about = "Run agentnet experiments in batch")]
struct Args {
    /// Delimited experiments file (one header row, one experiment per row)
    #[arg(long, short = 'e')]
    experiments: PathBuf,

    /// Optional JSON engine configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the worker cap from the configuration
    #[arg(long, short = 't')]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("configuration rejected: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    info!("starting agentnet engine v{}", VERSION);

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(threads) = args.threads {
        config.threads = threads;
    }

    let app = App::with_builtin_plugins(&config);
    let project_name = args
        .experiments
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("project")
        .to_string();
    let project = app.new_project(&project_name);

    let (imported, warnings) = project.import_experiments(&args.experiments)?;
    for warning in &warnings {
        warn!("{}", warning);
    }
    if imported == 0 {
        anyhow::bail!(
            "no experiment could be imported from '{}'",
            args.experiments.display()
        );
    }
    info!(imported, "experiments imported; playing all");

    project.play_all();
    app.exp_mgr().wait_idle();

    let mut invalid = 0;
    for exp in project.experiments() {
        let status = exp.status();
        info!(exp = exp.id(), ?status, progress = exp.progress(), "done");
        if status != ExpStatus::Finished {
            invalid += 1;
            if !exp.error().is_empty() {
                warn!(exp = exp.id(), "last error: {}", exp.error());
            }
        }
    }

    Ok(if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}
