use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use vigild::config::{DaemonConfig, Overrides};
use vigild::controller::queue::PendingQueue;
use vigild::controller::Controller;
use vigild::report::Reporter;
use vigild::watcher::GitWatcher;

#[derive(Parser)]
#[command(
    name = "vigild",
    about = "Vigil daemon — runs a validation command against files changed on a tracked git branch",
    version
)]
struct Args {
    #[command(subcommand)]
    cmd: Option<Command>,

    /// Path to a TOML config file
    #[arg(long, env = "VIGILD_CONFIG")]
    config: Option<PathBuf>,

    /// Local clone of the git repository to watch
    #[arg(long = "repo", env = "VIGILD_REPO")]
    repo_dir: Option<PathBuf>,

    /// Branch to track for new commits (default: main)
    #[arg(long, env = "VIGILD_BRANCH")]
    branch: Option<String>,

    /// Validation command; the changed file path is appended as the last argument
    #[arg(long = "command", env = "VIGILD_COMMAND")]
    validation_command: Option<String>,

    /// Maximum concurrently running validations (default: 3)
    #[arg(long, env = "VIGILD_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Seconds between branch polls (default: 300)
    #[arg(long = "poll-interval", env = "VIGILD_POLL_INTERVAL")]
    poll_interval_secs: Option<u64>,

    /// SSH identity file used by git fetch
    #[arg(long, env = "VIGILD_SSH_KEY")]
    ssh_key: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "VIGILD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "VIGILD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the branch and run validations (default when no subcommand given).
    Run,
    /// Validate the configuration and repository access, print the resolved
    /// settings, and exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let overrides = Overrides {
        repo_dir: args.repo_dir,
        branch: args.branch,
        validation_command: args.validation_command,
        max_concurrent: args.max_concurrent,
        poll_interval_secs: args.poll_interval_secs,
        ssh_key: args.ssh_key,
        log: args.log,
        log_file: args.log_file,
    };
    let config = DaemonConfig::load(args.config.as_deref(), overrides)?;

    match args.cmd {
        Some(Command::Check) => run_check(&config),
        None | Some(Command::Run) => run_daemon(config).await,
    }
}

fn run_check(config: &DaemonConfig) -> Result<()> {
    println!("repo_dir:           {}", config.repo_dir.display());
    println!("branch:             {}", config.branch);
    println!("validation_command: {}", config.validation_command);
    println!("max_concurrent:     {}", config.max_concurrent);
    println!("poll_interval:      {}s", config.poll_interval.as_secs());

    // Probing the repo exercises the same validation the daemon startup does.
    GitWatcher::open(
        &config.repo_dir,
        &config.branch,
        config.ssh_key.as_deref(),
        Arc::new(PendingQueue::new()),
        Reporter::new(),
    )
    .context("repository validation failed")?;
    println!("repository:         ok");
    Ok(())
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let _guard = setup_logging(&config.log, config.log_file.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), "vigild starting");
    info!(
        repo = %config.repo_dir.display(),
        branch = %config.branch,
        max_concurrent = config.max_concurrent,
        poll_interval_secs = config.poll_interval.as_secs(),
        "config loaded"
    );

    let queue = Arc::new(PendingQueue::new());
    let reporter = Reporter::new();

    let watcher = GitWatcher::open(
        &config.repo_dir,
        &config.branch,
        config.ssh_key.as_deref(),
        queue.clone(),
        reporter.clone(),
    )
    .context("repository validation failed")?;
    let watcher_task = watcher.spawn(config.poll_interval);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let controller = Controller::new(&config, queue, reporter);
    let controller_task = tokio::spawn(controller.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    // Stop producing new changes first, then let the controller clean up.
    watcher_task.abort();
    let _ = shutdown_tx.send(true);
    controller_task
        .await
        .context("controller task panicked")?;

    info!("vigild stopped");
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stderr and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("vigild.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stderr",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .with_writer(std::io::stderr)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(EnvFilter::new(log_level))
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .with(fmt::layer().with_writer(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        None
    }
}
