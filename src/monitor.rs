//! Idle-driven cache eviction.
//!
//! [`IdleMonitor`] keeps a last-active timestamp that every qualifying
//! interaction signal overwrites. A repeating check compares the idle time
//! against the threshold; past it, the cache is collected and the timestamp
//! is reset, so a user who stays away gets one collection per threshold
//! crossing rather than one per tick.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::backend::ActivityError;
use crate::backend::ActivityHandler;
use crate::backend::ActivityTarget;
use crate::backend::ListenerId;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::ConfigError;
use crate::config::positive_ms;
use crate::domain::ACTIVITY_KINDS;
use crate::domain::ActivityKind;
use crate::evict::CacheEvictor;
use crate::evict::EvictError;

/// Called after each successful eviction.
pub type CacheClearCallback = Arc<dyn Fn() + Send + Sync>;

/// Called with each failed eviction attempt.
pub type EvictionErrorCallback = Arc<dyn Fn(&EvictError) + Send + Sync>;

/// Errors that can occur while starting a monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Failed to register {kind} listener: {source}")]
    Listener {
        kind: ActivityKind,
        #[source]
        source: ActivityError,
    },
}

/// Validated monitor settings.
#[derive(Clone)]
pub struct MonitorOptions {
    check_interval: Duration,
    minimum_idle: Duration,
    on_cache_clear: Option<CacheClearCallback>,
    on_eviction_error: Option<EvictionErrorCallback>,
}

impl MonitorOptions {
    /// Both values are milliseconds and must be positive.
    pub fn new(check_interval_ms: i64, minimum_idle_ms: i64) -> Result<Self, ConfigError> {
        Ok(Self {
            check_interval: positive_ms("check_interval_ms", check_interval_ms)?,
            minimum_idle: positive_ms("minimum_idle_ms", minimum_idle_ms)?,
            on_cache_clear: None,
            on_eviction_error: None,
        })
    }

    #[must_use]
    pub fn on_cache_clear(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cache_clear = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_eviction_error(
        mut self,
        callback: impl Fn(&EvictError) + Send + Sync + 'static,
    ) -> Self {
        self.on_eviction_error = Some(Arc::new(callback));
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn minimum_idle(&self) -> Duration {
        self.minimum_idle
    }

    fn minimum_idle_ms(&self) -> u64 {
        u64::try_from(self.minimum_idle.as_millis()).unwrap_or(u64::MAX)
    }
}

impl fmt::Debug for MonitorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOptions")
            .field("check_interval", &self.check_interval)
            .field("minimum_idle", &self.minimum_idle)
            .field("on_cache_clear", &self.on_cache_clear.is_some())
            .field("on_eviction_error", &self.on_eviction_error.is_some())
            .finish()
    }
}

/// Strictly greater: sitting exactly at the threshold is not idle yet.
pub fn is_idle_beyond(elapsed_ms: u64, minimum_idle_ms: u64) -> bool {
    elapsed_ms > minimum_idle_ms
}

/// Point-in-time view of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// Last activity (or eviction reset), milliseconds since the epoch.
    pub last_active_ms: u64,
    /// Successful evictions so far.
    pub evictions: u64,
    /// Failed eviction attempts so far.
    pub failures: u64,
    pub disposed: bool,
}

/// Result of one idle evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Active,
    Evicted,
    Failed,
    Disposed,
}

/// State shared by the listeners, the check task and the monitor handle.
struct Shared {
    last_active_ms: AtomicU64,
    disposed: AtomicBool,
    evictions: AtomicU64,
    failures: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            last_active_ms: AtomicU64::new(clock.now_ms()),
            disposed: AtomicBool::new(false),
            evictions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            clock,
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Overwrite the last-active time with now. No-op once disposed.
    fn touch(&self) {
        if self.is_disposed() {
            return;
        }
        self.last_active_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            last_active_ms: self.last_active_ms.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            disposed: self.is_disposed(),
        }
    }
}

/// One idle evaluation: compare, collect, notify, reset.
struct IdleCheck {
    shared: Arc<Shared>,
    options: MonitorOptions,
    evictor: Arc<dyn CacheEvictor>,
}

impl IdleCheck {
    async fn run_once(&self) -> CheckOutcome {
        if self.shared.is_disposed() {
            return CheckOutcome::Disposed;
        }

        let now = self.shared.clock.now_ms();
        let last_active = self.shared.last_active_ms.load(Ordering::SeqCst);
        // Clock skew reads as "just active"
        let elapsed = now.saturating_sub(last_active);
        let threshold = self.options.minimum_idle_ms();

        if !is_idle_beyond(elapsed, threshold) {
            trace!("Idle for {}ms (threshold {}ms)", elapsed, threshold);
            return CheckOutcome::Active;
        }

        info!(
            "Idle for {}ms > {}ms, evicting unreferenced cache entries",
            elapsed, threshold
        );

        let result = self.evictor.gc().await;

        if self.shared.is_disposed() {
            debug!("Monitor disposed during eviction, dropping result");
            return CheckOutcome::Disposed;
        }

        let outcome = match result {
            Ok(()) => {
                self.shared.evictions.fetch_add(1, Ordering::SeqCst);
                if let Some(ref on_cache_clear) = self.options.on_cache_clear {
                    on_cache_clear();
                }
                CheckOutcome::Evicted
            }
            Err(e) => {
                self.shared.failures.fetch_add(1, Ordering::SeqCst);
                warn!("Cache eviction failed: {}", e);
                if let Some(ref on_eviction_error) = self.options.on_eviction_error {
                    on_eviction_error(&e);
                }
                CheckOutcome::Failed
            }
        };

        // Prevent the next tick from collecting again straight away
        self.shared.touch();
        outcome
    }

    async fn run(self, shutdown: CancellationToken) {
        let period = self.options.check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    if self.run_once().await == CheckOutcome::Disposed {
                        break;
                    }
                }
            }
        }

        debug!("Idle check loop stopped");
    }
}

/// Watches activity on a target and collects the cache after idle periods.
///
/// Dropping the monitor disposes it.
pub struct IdleMonitor {
    shared: Arc<Shared>,
    target: Arc<dyn ActivityTarget>,
    registrations: Vec<(ActivityKind, ListenerId)>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IdleMonitor {
    /// Start monitoring with the system clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        options: MonitorOptions,
        target: Arc<dyn ActivityTarget>,
        evictor: Arc<dyn CacheEvictor>,
    ) -> Result<Self, MonitorError> {
        Self::start_with_clock(options, target, evictor, Arc::new(SystemClock::new()))
    }

    /// Start monitoring with a caller-supplied clock.
    pub fn start_with_clock(
        options: MonitorOptions,
        target: Arc<dyn ActivityTarget>,
        evictor: Arc<dyn CacheEvictor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MonitorError> {
        let shared = Arc::new(Shared::new(clock));

        let handler: ActivityHandler = {
            let shared = Arc::clone(&shared);
            Arc::new(move || shared.touch())
        };

        let mut registrations = Vec::with_capacity(ACTIVITY_KINDS.len());
        for kind in ACTIVITY_KINDS {
            match target.add_listener(kind, Arc::clone(&handler)) {
                Ok(id) => registrations.push((kind, id)),
                Err(source) => {
                    for (registered, id) in registrations {
                        target.remove_listener(registered, id);
                    }
                    return Err(MonitorError::Listener { kind, source });
                }
            }
        }

        info!(
            "Idle monitor started, checking every {:?} (threshold {:?})",
            options.check_interval, options.minimum_idle
        );

        let shutdown = CancellationToken::new();
        let check = IdleCheck {
            shared: Arc::clone(&shared),
            options,
            evictor,
        };
        let task = tokio::spawn(check.run(shutdown.clone()));

        Ok(Self {
            shared,
            target,
            registrations,
            shutdown,
            task: Some(task),
        })
    }

    /// Count as user activity, same as any interaction signal.
    pub fn record_activity(&self) {
        self.shared.touch();
    }

    pub fn last_active_ms(&self) -> u64 {
        self.shared.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.shared.snapshot()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stop checking and remove every listener. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(task) = self.teardown() {
            task.abort();
        }
    }

    /// Dispose and wait for the check task to finish.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.teardown() {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!("Idle check task failed: {}", e);
            }
        }
    }

    fn teardown(&mut self) -> Option<JoinHandle<()>> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return None;
        }

        self.shutdown.cancel();
        for (kind, id) in self.registrations.drain(..) {
            self.target.remove_listener(kind, id);
        }

        info!("Idle monitor disposed");
        self.task.take()
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for IdleMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleMonitor")
            .field("snapshot", &self.snapshot())
            .field("listeners", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ActivityHub;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_evictor(counter: &Arc<AtomicUsize>) -> Arc<dyn CacheEvictor> {
        let counter = Arc::clone(counter);
        Arc::new(move || -> Result<(), EvictError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn options(check_interval_ms: i64, minimum_idle_ms: i64) -> MonitorOptions {
        MonitorOptions::new(check_interval_ms, minimum_idle_ms).unwrap()
    }

    fn manual_check(
        clock: &ManualClock,
        options: MonitorOptions,
        evictor: Arc<dyn CacheEvictor>,
    ) -> IdleCheck {
        IdleCheck {
            shared: Arc::new(Shared::new(Arc::new(clock.clone()))),
            options,
            evictor,
        }
    }

    /// Registration fails once `fail_at` listeners are in place.
    struct FlakyTarget {
        hub: ActivityHub,
        fail_at: usize,
        added: AtomicUsize,
    }

    impl ActivityTarget for FlakyTarget {
        fn add_listener(
            &self,
            kind: ActivityKind,
            handler: ActivityHandler,
        ) -> Result<ListenerId, ActivityError> {
            if self.added.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(ActivityError::TargetClosed);
            }
            self.hub.add_listener(kind, handler)
        }

        fn remove_listener(&self, kind: ActivityKind, id: ListenerId) {
            self.hub.remove_listener(kind, id);
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(MonitorOptions::new(1, 1).is_ok());
        assert_eq!(
            MonitorOptions::new(0, 5000).unwrap_err(),
            ConfigError::NonPositive {
                field: "check_interval_ms",
                value: 0
            }
        );
        assert_eq!(
            MonitorOptions::new(-1000, 5000).unwrap_err(),
            ConfigError::NonPositive {
                field: "check_interval_ms",
                value: -1000
            }
        );
        assert_eq!(
            MonitorOptions::new(1000, 0).unwrap_err(),
            ConfigError::NonPositive {
                field: "minimum_idle_ms",
                value: 0
            }
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(!is_idle_beyond(4_999, 5_000));
        assert!(!is_idle_beyond(5_000, 5_000));
        assert!(is_idle_beyond(5_001, 5_000));
    }

    #[tokio::test]
    async fn test_check_at_threshold_does_not_evict() {
        let clock = ManualClock::new(10_000);
        let count = Arc::new(AtomicUsize::new(0));
        let check = manual_check(&clock, options(1000, 2000), counting_evictor(&count));

        clock.advance(Duration::from_millis(2000));
        assert_eq!(check.run_once().await, CheckOutcome::Active);

        clock.advance(Duration::from_millis(1));
        assert_eq!(check.run_once().await, CheckOutcome::Evicted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Eviction moment becomes the new activity boundary
        assert_eq!(check.shared.snapshot().last_active_ms, 12_001);
    }

    #[tokio::test]
    async fn test_clock_skew_counts_as_active() {
        let clock = ManualClock::new(50_000);
        let count = Arc::new(AtomicUsize::new(0));
        let check = manual_check(&clock, options(1000, 1000), counting_evictor(&count));

        clock.set(10_000);
        assert_eq!(check.run_once().await, CheckOutcome::Active);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_eviction_reports_and_resets() {
        let clock = ManualClock::new(0);
        let cleared = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let opts = {
            let cleared = Arc::clone(&cleared);
            let errors = Arc::clone(&errors);
            options(1000, 1000)
                .on_cache_clear(move || {
                    cleared.fetch_add(1, Ordering::SeqCst);
                })
                .on_eviction_error(move |e| {
                    assert_eq!(e.to_string(), "cache unavailable");
                    errors.fetch_add(1, Ordering::SeqCst);
                })
        };
        let failing: Arc<dyn CacheEvictor> = Arc::new(|| -> Result<(), EvictError> {
            Err(EvictError::Other("cache unavailable".to_string()))
        });
        let check = manual_check(&clock, opts, failing);

        clock.set(5_000);
        assert_eq!(check.run_once().await, CheckOutcome::Failed);
        assert_eq!(cleared.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let snapshot = check.shared.snapshot();
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.last_active_ms, 5_000);

        // Still monitoring after a failure
        clock.set(6_001);
        assert_eq!(check.run_once().await, CheckOutcome::Failed);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_activity_writes_are_idempotent() {
        let clock = ManualClock::new(1_000);
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let monitor = IdleMonitor::start_with_clock(
            options(60_000, 60_000),
            hub.clone(),
            counting_evictor(&count),
            Arc::new(clock.clone()),
        )
        .unwrap();

        clock.set(7_777);
        for kind in ACTIVITY_KINDS {
            hub.dispatch(kind);
            hub.dispatch(kind);
        }
        assert_eq!(monitor.last_active_ms(), 7_777);

        clock.set(8_000);
        monitor.record_activity();
        assert_eq!(monitor.last_active_ms(), 8_000);
    }

    #[tokio::test]
    async fn test_every_signal_is_subscribed() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let mut monitor =
            IdleMonitor::start(options(1000, 1000), hub.clone(), counting_evictor(&count))
                .unwrap();

        for kind in ACTIVITY_KINDS {
            assert_eq!(hub.listener_count(kind), 1, "{kind} not subscribed");
        }

        monitor.dispose();
        for kind in ACTIVITY_KINDS {
            assert_eq!(hub.listener_count(kind), 0, "{kind} still subscribed");
        }
    }

    #[tokio::test]
    async fn test_registration_failure_rolls_back() {
        let target = Arc::new(FlakyTarget {
            hub: ActivityHub::new(),
            fail_at: 3,
            added: AtomicUsize::new(0),
        });
        let count = Arc::new(AtomicUsize::new(0));

        let err =
            IdleMonitor::start(options(1000, 1000), target.clone(), counting_evictor(&count))
                .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Listener {
                kind: ActivityKind::Scroll,
                ..
            }
        ));
        for kind in ACTIVITY_KINDS {
            assert_eq!(target.hub.listener_count(kind), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_evicts_once_past_threshold() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let cleared = Arc::new(AtomicUsize::new(0));
        let opts = {
            let cleared = Arc::clone(&cleared);
            options(1000, 5000).on_cache_clear(move || {
                cleared.fetch_add(1, Ordering::SeqCst);
            })
        };
        let monitor = IdleMonitor::start(opts, hub, counting_evictor(&count)).unwrap();

        sleep(Duration::from_millis(5500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(cleared.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.snapshot().evictions, 1);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_postpones_eviction() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let monitor =
            IdleMonitor::start(options(1000, 5000), hub.clone(), counting_evictor(&count))
                .unwrap();

        sleep(Duration::from_millis(4000)).await;
        hub.dispatch(ActivityKind::Click);

        // 5000ms mark: one second since the click
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // 9000ms mark: exactly at the threshold since the click
        sleep(Duration::from_millis(4000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_longer_than_threshold_evicts_every_tick() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let monitor =
            IdleMonitor::start(options(2000, 1000), hub, counting_evictor(&count)).unwrap();

        sleep(Duration::from_millis(10_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_shorter_than_threshold_waits_out_reset() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let monitor =
            IdleMonitor::start(options(1000, 2500), hub, counting_evictor(&count)).unwrap();

        // Evicts at 3000, then needs another 3000 after the reset
        sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_all_effects() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let cleared = Arc::new(AtomicUsize::new(0));
        let opts = {
            let cleared = Arc::clone(&cleared);
            options(1000, 1000).on_cache_clear(move || {
                cleared.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut monitor =
            IdleMonitor::start(opts, hub.clone(), counting_evictor(&count)).unwrap();

        // Dispose before any idle episode
        monitor.dispose();
        monitor.dispose();
        assert!(monitor.is_disposed());
        let frozen = monitor.last_active_ms();

        sleep(Duration::from_millis(500)).await;
        hub.dispatch(ActivityKind::Click);
        monitor.record_activity();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(cleared.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.last_active_ms(), frozen);
    }

    #[tokio::test]
    async fn test_drop_removes_listeners() {
        let hub = Arc::new(ActivityHub::new());
        let count = Arc::new(AtomicUsize::new(0));
        let monitor =
            IdleMonitor::start(options(1000, 1000), hub.clone(), counting_evictor(&count))
                .unwrap();
        assert_eq!(hub.listener_count(ActivityKind::PointerMove), 1);

        drop(monitor);
        assert_eq!(hub.listener_count(ActivityKind::PointerMove), 0);
    }
}
