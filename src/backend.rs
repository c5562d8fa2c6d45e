//! Activity plumbing between the host and the idle monitor.
//!
//! An [`ActivityTarget`] is the global context listeners register on (the
//! browser `window` in a web host). [`ActivityHub`] is the in-process
//! implementation; an [`ActivitySource`] feeds it from the outside world.

mod stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
pub use stream::LineSource;
pub use stream::UnixSocketSource;
pub use stream::parse_activity_line;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;

use crate::domain::ActivityKind;

/// Callback run for every occurrence of a subscribed signal.
pub type ActivityHandler = Arc<dyn Fn() + Send + Sync>;

/// Registration handle returned by [`ActivityTarget::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A context that interaction signals are dispatched on.
pub trait ActivityTarget: Send + Sync {
    /// Subscribe `handler` to `kind`.
    fn add_listener(
        &self,
        kind: ActivityKind,
        handler: ActivityHandler,
    ) -> Result<ListenerId, ActivityError>;

    /// Unsubscribe a listener. Unknown ids are ignored.
    fn remove_listener(&self, kind: ActivityKind, id: ListenerId);
}

/// Trait for activity event sources.
#[async_trait]
pub trait ActivitySource: Send {
    /// Get the next qualifying interaction signal.
    ///
    /// Lines or messages that are not activity are skipped internally.
    async fn next_activity(&mut self) -> Result<ActivityKind, ActivityError>;
}

/// Errors that can occur while receiving or dispatching activity.
#[derive(Error, Debug)]
pub enum ActivityError {
    #[error("Socket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Socket path not found: {0}")]
    SocketNotFound(String),

    #[error("Activity stream ended")]
    Disconnected,

    #[error("Failed to read activity: {0}")]
    ReadError(String),

    #[error("Activity target is closed")]
    TargetClosed,
}

/// In-process activity target.
///
/// Dispatch runs every listener for the signal synchronously on the calling
/// thread, outside the registry lock.
#[derive(Default)]
pub struct ActivityHub {
    listeners: Mutex<HashMap<ActivityKind, Vec<(ListenerId, ActivityHandler)>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ActivityHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every listener subscribed to `kind`. Returns how many ran.
    pub fn dispatch(&self, kind: ActivityKind) -> usize {
        let handlers: Vec<ActivityHandler> = {
            let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners
                .get(&kind)
                .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };

        trace!("Dispatching {} to {} listener(s)", kind, handlers.len());
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }

    /// Number of listeners currently subscribed to `kind`.
    pub fn listener_count(&self, kind: ActivityKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Refuse new registrations. Existing listeners stay until removed.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl ActivityTarget for ActivityHub {
    fn add_listener(
        &self,
        kind: ActivityKind,
        handler: ActivityHandler,
    ) -> Result<ListenerId, ActivityError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ActivityError::TargetClosed);
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    fn remove_listener(&self, kind: ActivityKind, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = listeners.get_mut(&kind) {
            entries.retain(|(existing, _)| *existing != id);
            if entries.is_empty() {
                listeners.remove(&kind);
            }
        }
    }
}

/// Forward activity from `source` into `hub` until cancelled or the source fails.
pub async fn pump(
    mut source: impl ActivitySource,
    hub: &ActivityHub,
    shutdown: CancellationToken,
) -> Result<(), ActivityError> {
    info!("Activity pump started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Activity pump stopped");
                return Ok(());
            }
            activity = source.next_activity() => {
                let kind = activity?;
                let delivered = hub.dispatch(kind);
                if delivered == 0 {
                    debug!("No listeners for {}", kind);
                }
            }
        }
    }
}
