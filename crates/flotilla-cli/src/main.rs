//! flotilla — the deployment orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! flotilla deploy manifest.yml
//! flotilla deploy manifest.yml --recreate
//! flotilla deploy manifest.yml --job-state web/0=stopped --job-state web/1=recreate
//! flotilla upload-release releases.yml
//! ```
//!
//! Exit codes: 0 success, 1 validation error, 2 runtime failure,
//! 3 cancelled, 4 lock unavailable.
//!
//! Environment: `DEPLOY_CONFIG` points at the orchestrator config file;
//! `LOG_LEVEL` (or `RUST_LOG`) controls log verbosity.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use flotilla_cloud::{FakeAgent, FakeCloud, LockError, LockManager};
use flotilla_deploy::{DeployError, Deployer, OrchestratorConfig};
use flotilla_eventlog::{EventLog, Renderer, RendererOptions, SystemClock};
use flotilla_plan::{DeployOptions, JobStateOverride, OverrideState, ReleaseVersion};
use flotilla_state::StateStore;

#[derive(Parser)]
#[command(
    name = "flotilla",
    about = "Flotilla — declarative VM fleet orchestrator",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a deployment manifest
    Deploy {
        /// Path to the deployment manifest (YAML)
        manifest: PathBuf,

        /// Replace every instance VM even when specs match
        #[arg(long)]
        recreate: bool,

        /// Per-instance target state override (repeatable), e.g.
        /// web/0=stopped, worker/2=recreate
        #[arg(long = "job-state", value_name = "JOB/INDEX=STATE")]
        job_state: Vec<String>,
    },

    /// Publish release versions (with their template property schemas)
    /// into the store
    UploadRelease {
        /// YAML file holding one release version or a sequence of them
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Deploy {
            manifest,
            recreate,
            job_state,
        } => runtime.block_on(run_deploy(config, manifest, recreate, job_state)),
        Commands::UploadRelease { path } => upload_release(&config, &path),
    }
}

/// `LOG_LEVEL` wins, then `RUST_LOG`, then a quiet default.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "warn,flotilla=info".parse().unwrap_or_default());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_deploy(
    config: OrchestratorConfig,
    manifest_path: PathBuf,
    recreate: bool,
    job_state: Vec<String>,
) -> ExitCode {
    let manifest_text = match std::fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(e) => {
            error!("cannot read manifest {}: {e}", manifest_path.display());
            return ExitCode::from(1);
        }
    };

    let job_states = match parse_job_states(&job_state) {
        Ok(overrides) => overrides,
        Err(message) => {
            error!("{message}");
            return ExitCode::from(1);
        }
    };
    let options = DeployOptions {
        recreate,
        job_states,
    };

    let store = match StateStore::open(&config.store_path) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open state store: {e}");
            return ExitCode::from(2);
        }
    };

    let clock = Arc::new(SystemClock);
    let (events, mut stream) = EventLog::channel(config.event_buffer, clock.clone());

    // Renderer consumes the event stream on its own task, optionally
    // teeing raw NDJSON lines into the configured sink.
    let renderer = Arc::new(Renderer::new(
        std::io::stdout(),
        clock.clone(),
        RendererOptions {
            no_progress_bar_stages: config.no_progress_bar_stages.iter().cloned().collect(),
        },
    ));
    let sink_path = config.event_log_path.clone();
    let consumer = {
        let renderer = renderer.clone();
        tokio::spawn(async move {
            let mut sink = sink_path.and_then(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            });
            while let Some(event) = stream.next().await {
                if let Some(file) = sink.as_mut() {
                    let _ = writeln!(file, "{}", event.to_line());
                }
                renderer.handle_event(event);
            }
        })
    };

    // Ctrl-C requests a graceful halt: in-flight transitions finish, no
    // new batches start.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested");
            let _ = cancel_tx.send(true);
        }
    });

    // The simulated cloud and agent converge state in-process. Production
    // provider and agent adapters plug in here.
    let cloud = Arc::new(FakeCloud::new());
    let agent = Arc::new(FakeAgent::new());

    let deployer = Deployer::new(
        store,
        cloud,
        agent,
        clock,
        LockManager::new(),
        events,
        config.max_threads,
    );

    let result = deployer.deploy(&manifest_text, &options, cancel_rx).await;

    // Dropping the deployer releases the last event producer so the
    // consumer drains and exits.
    drop(deployer);
    let _ = consumer.await;
    renderer.finish();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("deploy failed: {error}");
            ExitCode::from(exit_code(&error))
        }
    }
}

fn upload_release(config: &OrchestratorConfig, path: &std::path::Path) -> ExitCode {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            error!("cannot read {}: {e}", path.display());
            return ExitCode::from(1);
        }
    };

    let releases: Vec<ReleaseVersion> = match serde_yaml::from_str::<Vec<ReleaseVersion>>(&text) {
        Ok(list) => list,
        Err(_) => match serde_yaml::from_str::<ReleaseVersion>(&text) {
            Ok(single) => vec![single],
            Err(e) => {
                error!("invalid release file {}: {e}", path.display());
                return ExitCode::from(1);
            }
        },
    };

    let store = match StateStore::open(&config.store_path) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open state store: {e}");
            return ExitCode::from(2);
        }
    };

    for release in &releases {
        if let Err(e) = store.put_release_version(release) {
            error!("failed to store {}: {e}", release.key());
            return ExitCode::from(2);
        }
        println!("Uploaded release {}", release.key());
    }
    ExitCode::SUCCESS
}

/// Parse repeated `job/index=state` overrides.
fn parse_job_states(args: &[String]) -> Result<Vec<JobStateOverride>, String> {
    let mut overrides = Vec::with_capacity(args.len());
    for arg in args {
        let (target, state) = arg
            .split_once('=')
            .ok_or_else(|| format!("--job-state {arg}: expected job/index=state"))?;
        let (job, index) = target
            .split_once('/')
            .ok_or_else(|| format!("--job-state {arg}: expected job/index=state"))?;
        let index: u32 = index
            .parse()
            .map_err(|_| format!("--job-state {arg}: index must be an integer"))?;
        let state = match state {
            "started" => OverrideState::Started,
            "stopped" => OverrideState::Stopped,
            "detached" => OverrideState::Detached,
            "recreate" => OverrideState::Recreate,
            other => {
                return Err(format!(
                    "--job-state {arg}: unknown state {other} (use started, stopped, detached or recreate)"
                ))
            }
        };
        overrides.push(JobStateOverride {
            job: job.to_string(),
            index,
            state,
        });
    }
    Ok(overrides)
}

/// Stable exit codes for scripting: 1 validation, 2 runtime, 3 cancelled,
/// 4 lock unavailable.
fn exit_code(error: &DeployError) -> u8 {
    match error {
        DeployError::Validation(_) | DeployError::Config(_) => 1,
        DeployError::Cancelled => 3,
        DeployError::Lock(LockError::Unavailable(_)) => 4,
        _ => 2,
    }
}
