//! idle-evictd - Collects a client cache after the user goes idle.
//!
//! Reads interaction events from stdin or a Unix socket and runs the
//! configured GC command once the session has been idle long enough.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use idle_evict::ACTIVITY_KINDS;
use idle_evict::ActivityHub;
use idle_evict::ActivityTarget;
use idle_evict::CacheEvictor;
use idle_evict::Config;
use idle_evict::IdleMonitor;
use idle_evict::backend::ActivityError;
use idle_evict::backend::LineSource;
use idle_evict::backend::UnixSocketSource;
use idle_evict::backend::pump;
use idle_evict::evict::CommandEvictor;
use idle_evict::evict::LogEvictor;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Idle cache eviction daemon.
///
/// Watches user activity and collects the cache after an idle period.
#[derive(Parser, Debug)]
#[command(name = "idle-evictd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable dry-run mode (don't actually run the GC command).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Milliseconds between idle checks (overrides config).
    #[arg(long, allow_hyphen_values = true)]
    check_interval_ms: Option<i64>,

    /// Milliseconds of inactivity before collecting (overrides config).
    #[arg(long, allow_hyphen_values = true)]
    minimum_idle_ms: Option<i64>,

    /// Read activity from this Unix socket instead of stdin.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Print recognized activity events to stdout.
    #[arg(long)]
    print_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("idle-evictd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;

    if args.dry_run {
        config.dry_run = true;
    }
    if let Some(ms) = args.check_interval_ms {
        config.check_interval_ms = ms;
    }
    if let Some(ms) = args.minimum_idle_ms {
        config.minimum_idle_ms = ms;
    }
    if args.socket.is_some() {
        config.activity_socket = args.socket;
    }

    info!("Configuration loaded (dry_run={})", config.dry_run);

    run_daemon(config, args.print_events).await
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idle_evict={level},idle_evictd={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C.
async fn detect_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    }
}

fn build_evictor(config: &Config) -> Result<Arc<dyn CacheEvictor>> {
    let Some(ref program) = config.gc_command else {
        warn!("No gc_command configured; idle periods will only be logged");
        return Ok(Arc::new(LogEvictor));
    };

    let evictor = CommandEvictor::new(
        program.clone(),
        config.gc_args.clone(),
        config.dry_run,
        config.gc_timeout(),
    )
    .context("Failed to initialize GC command")?;

    Ok(Arc::new(evictor))
}

/// Run the daemon until Ctrl-C or until the activity stream ends.
async fn run_daemon(config: Config, print_events: bool) -> Result<()> {
    let options = config
        .monitor_options()
        .context("Invalid monitor settings")?
        .on_cache_clear(|| info!("Cache collected after idle period"));

    let evictor = build_evictor(&config)?;
    let hub = Arc::new(ActivityHub::new());

    if print_events {
        for kind in ACTIVITY_KINDS {
            hub.add_listener(kind, Arc::new(move || println!("[ACTIVITY] | {kind}")))?;
        }
    }

    let monitor = IdleMonitor::start(options, hub.clone(), evictor)
        .context("Failed to start idle monitor")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(detect_shutdown(shutdown.clone()));

    info!("Daemon started, waiting for activity...");

    let result = match config.activity_socket {
        Some(ref path) => match UnixSocketSource::connect(path).await {
            Ok(source) => pump(source, &hub, shutdown.clone()).await,
            Err(e) => Err(e),
        },
        None => pump(LineSource::stdin(), &hub, shutdown.clone()).await,
    };

    shutdown.cancel();
    debug!("Final state: {:?}", monitor.snapshot());
    monitor.shutdown().await;

    match result {
        Ok(()) => Ok(()),
        Err(ActivityError::Disconnected) => {
            info!("Activity stream closed, exiting");
            Ok(())
        }
        Err(e) => Err(e).context("Activity source failed"),
    }
}
