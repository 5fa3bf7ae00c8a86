use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use vet_core::config::{require_var, EnvSource, ProcessEnv, StageSettings, DATABASE_URL};
use vet_core::types::{PackageId, Request, Stage};
use vetd::health::PipelineHealth;
use vetd::logging::{init_logging, LogFormat, LOG_FORMAT_ENV};
use vetd::persistence::SqliteStore;
use vetd::queue::{record_decision, Decision, DirectQueue};
use vetd::state_machine::AdvanceOutcome;
use vetd::worker_loop::{StatusHandle, WorkerLoop};
use vetd::workers::StageWorker;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
const SUPERVISOR_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(name = "vetd", version, about = "Package vetting pipeline daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run stage workers until SIGINT/SIGTERM.
    Run {
        /// Stage to run; repeat for several. Defaults to all five.
        #[arg(long = "stage", value_name = "STAGE")]
        stages: Vec<Stage>,
        /// Run a single cycle per stage and exit.
        #[arg(long)]
        once: bool,
    },
    /// Store a dependency manifest as a new request.
    Submit { manifest: PathBuf },
    /// Package counts per status and packages carrying an error.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Approve or reject a package waiting for approval.
    Decide { package_id: String, decision: Decision },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("vetd failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = ProcessEnv;
    init_logging(LogFormat::from_env_value(
        env.var(LOG_FORMAT_ENV).as_deref(),
    ));

    match cli.command {
        Command::Run { stages, once } => run_pipeline(&env, selected_stages(stages), once),
        Command::Submit { manifest } => run_submit(&env, manifest),
        Command::Status { json } => run_status(&env, json),
        Command::Decide {
            package_id,
            decision,
        } => run_decide(&env, PackageId::new(package_id), decision),
    }
}

/// Requested stages in pipeline order, without duplicates.
fn selected_stages(requested: Vec<Stage>) -> Vec<Stage> {
    if requested.is_empty() {
        return Stage::ALL.to_vec();
    }
    Stage::ALL
        .into_iter()
        .filter(|stage| requested.contains(stage))
        .collect()
}

fn open_store(env: &dyn EnvSource) -> anyhow::Result<SqliteStore> {
    let url = require_var(env, DATABASE_URL)?;
    let store = SqliteStore::connect(&url).with_context(|| format!("failed to open {url}"))?;
    store.migrate().context("failed to migrate schema")?;
    Ok(store)
}

fn build_loops(
    env: &dyn EnvSource,
    stages: &[Stage],
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<Vec<WorkerLoop<StageWorker>>> {
    let mut loops = Vec::with_capacity(stages.len());
    for stage in stages {
        let settings = StageSettings::from_env(*stage, env)?;
        loops.push(WorkerLoop::new(
            StageWorker::for_stage(*stage, settings),
            settings.sleep,
            shutdown.clone(),
        ));
    }
    // Every missing variable is reported before any worker touches storage.
    for worker in &loops {
        worker.validate_env(env)?;
    }
    for worker in &mut loops {
        worker
            .prepare(env)
            .with_context(|| format!("failed to initialize {}", worker.name()))?;
    }
    Ok(loops)
}

fn run_pipeline(env: &dyn EnvSource, stages: Vec<Stage>, once: bool) -> anyhow::Result<()> {
    let started_at = Utc::now();
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut loops = build_loops(env, &stages, &shutdown)?;

    if once {
        let mut failed = Vec::new();
        for worker in &mut loops {
            if !worker.run_once(env)? {
                let error = worker.status().last_error.unwrap_or_default();
                failed.push(format!("{} ({error})", worker.name()));
            }
        }
        if !failed.is_empty() {
            bail!("cycle failed for {}", failed.join(", "));
        }
        return Ok(());
    }

    signal_hook::flag::register(SIGINT, shutdown.clone()).context("failed to register SIGINT")?;
    signal_hook::flag::register(SIGTERM, shutdown.clone())
        .context("failed to register SIGTERM")?;

    let handles = loops
        .iter()
        .map(WorkerLoop::status_handle)
        .collect::<Vec<StatusHandle>>();
    let mut threads = Vec::with_capacity(loops.len());
    for mut worker in loops {
        let name = worker.name().to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.start(&ProcessEnv))
            .with_context(|| format!("failed to spawn {name}"))?;
        threads.push((name, thread));
    }
    tracing::info!(workers = threads.len(), "pipeline started");

    let mut last_health = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(SUPERVISOR_TICK);
        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            log_health(&handles, started_at);
            last_health = Instant::now();
        }
    }

    tracing::info!("shutdown requested, waiting for workers");
    let mut errors = Vec::new();
    for (name, thread) in threads {
        match thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => errors.push(format!("{name}: {err}")),
            Err(_) => errors.push(format!("{name}: thread panicked")),
        }
    }
    log_health(&handles, started_at);
    if !errors.is_empty() {
        bail!("workers exited with errors: {}", errors.join("; "));
    }
    Ok(())
}

fn log_health(handles: &[StatusHandle], started_at: chrono::DateTime<Utc>) {
    let snapshots = handles
        .iter()
        .map(StatusHandle::snapshot)
        .collect::<Vec<_>>();
    let health = PipelineHealth::evaluate(&snapshots, started_at, Utc::now());
    tracing::info!(status = ?health.status, "{}", health.display_compact());
}

fn run_submit(env: &dyn EnvSource, manifest: PathBuf) -> anyhow::Result<()> {
    let payload = fs::read_to_string(&manifest)
        .with_context(|| format!("failed to read manifest at {}", manifest.display()))?;
    let store = open_store(env)?;
    let request = Request::new(payload, Utc::now());
    store.insert_request(&request)?;
    tracing::info!(request_id = %request.id, manifest = %manifest.display(), "request submitted");
    println!("{}", request.id);
    Ok(())
}

fn run_status(env: &dyn EnvSource, json: bool) -> anyhow::Result<()> {
    let store = open_store(env)?;
    let counts = store.status_counts()?;
    let failing = store.failing_packages()?;

    if json {
        let counts = counts
            .iter()
            .map(|(status, count)| (status.as_str().to_string(), serde_json::Value::from(*count)))
            .collect::<serde_json::Map<_, _>>();
        let out = serde_json::json!({ "counts": counts, "failing": failing });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("failed to serialize status")?
        );
        return Ok(());
    }

    println!("{:<20} COUNT", "STATUS");
    for (status, count) in &counts {
        println!("{:<20} {}", status.as_str(), count);
    }
    if failing.is_empty() {
        return Ok(());
    }
    println!();
    println!(
        "{:<38} {:<32} {:<20} {:>8}  ERROR",
        "PACKAGE", "COORDINATE", "STATUS", "ATTEMPTS"
    );
    for package in &failing {
        let attempts = if package.failed_permanently {
            format!("{}!", package.attempts)
        } else {
            package.attempts.to_string()
        };
        println!(
            "{:<38} {:<32} {:<20} {:>8}  {}",
            package.id,
            package.coordinate(),
            package.status.as_str(),
            attempts,
            package.last_error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

fn run_decide(env: &dyn EnvSource, package_id: PackageId, decision: Decision) -> anyhow::Result<()> {
    let store = open_store(env)?;
    let queue = DirectQueue::new(&store);
    match record_decision(&queue, &package_id, decision)? {
        AdvanceOutcome::Applied { .. } => {
            println!("{package_id} -> {}", decision.target());
            Ok(())
        }
        AdvanceOutcome::Conflict { current } => {
            bail!("{package_id} is already {current}")
        }
        AdvanceOutcome::NotFound => bail!("package {package_id} not found"),
        AdvanceOutcome::IllegalTarget => bail!("{} is not a decision target", decision.target()),
    }
}
