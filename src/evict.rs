//! Cache eviction primitives.
//!
//! The idle monitor only knows how to call [`CacheEvictor::gc`]. The cache
//! itself lives elsewhere: in-process callers pass a closure, the daemon runs
//! an external command.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

/// After the first few failures, only every Nth is logged.
const ERROR_LOG_RATE_LIMIT: u32 = 10;

/// "Evict unreferenced entries" capability of an external cache.
#[async_trait]
pub trait CacheEvictor: Send + Sync {
    async fn gc(&self) -> Result<(), EvictError>;
}

#[async_trait]
impl<F> CacheEvictor for F
where
    F: Fn() -> Result<(), EvictError> + Send + Sync,
{
    async fn gc(&self) -> Result<(), EvictError> {
        (self)()
    }
}

/// Errors raised by an eviction attempt.
#[derive(Error, Debug)]
pub enum EvictError {
    #[error("GC command not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to spawn GC command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("GC command exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("GC command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Other(String),
}

/// Evictor that only logs; used when no GC command is configured.
#[derive(Debug, Default)]
pub struct LogEvictor;

#[async_trait]
impl CacheEvictor for LogEvictor {
    async fn gc(&self) -> Result<(), EvictError> {
        info!("Idle threshold reached; no GC command configured");
        Ok(())
    }
}

/// Runs an external command as the cache GC primitive.
#[derive(Debug)]
pub struct CommandEvictor {
    /// Program to execute.
    program: PathBuf,

    /// Arguments passed to the program.
    args: Vec<String>,

    /// Dry run mode: log the command instead of running it.
    dry_run: bool,

    /// Upper bound on a single run.
    timeout: Duration,

    /// Count of consecutive failures.
    consecutive_failures: AtomicU32,

    /// Total failures, drives log rate limiting.
    error_log_count: AtomicU32,
}

impl CommandEvictor {
    /// Create an evictor for `program`.
    ///
    /// Bare names are resolved through `PATH` at run time; anything with a
    /// path separator must exist now.
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        dry_run: bool,
        timeout: Duration,
    ) -> Result<Self, EvictError> {
        let program = program.into();
        if is_explicit_path(&program) && !program.exists() {
            return Err(EvictError::NotFound(program));
        }

        info!("Using GC command: {}", program.display());

        Ok(Self {
            program,
            args,
            dry_run,
            timeout,
            consecutive_failures: AtomicU32::new(0),
            error_log_count: AtomicU32::new(0),
        })
    }

    /// Get count of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Check if the command appears healthy.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < 10
    }

    fn record_failure(&self, err: &EvictError) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);

        // Rate-limit error logging
        let count = self.error_log_count.fetch_add(1, Ordering::Relaxed);
        if count < 5 || count % ERROR_LOG_RATE_LIMIT == 0 {
            error!("GC command failed: {}", err);
            if count == 5 {
                warn!(
                    "Rate-limiting error logs (showing every {}th error)",
                    ERROR_LOG_RATE_LIMIT
                );
            }
        }
    }

    async fn run(&self) -> Result<(), EvictError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EvictError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| EvictError::TimedOut(self.timeout))?
            .map_err(EvictError::Spawn)?;

        if output.status.success() {
            trace!("GC command succeeded");
            Ok(())
        } else {
            Err(EvictError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl CacheEvictor for CommandEvictor {
    async fn gc(&self) -> Result<(), EvictError> {
        if self.dry_run {
            info!(
                "[DRY RUN] Would execute: {} {}",
                self.program.display(),
                self.args.join(" ")
            );
            return Ok(());
        }

        debug!(
            "Running GC command: {} {}",
            self.program.display(),
            self.args.join(" ")
        );

        match self.run().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }
}

fn is_explicit_path(program: &Path) -> bool {
    program.components().count() > 1 || program.is_absolute()
}
