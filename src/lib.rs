//! idle-evict - Idle-driven garbage collection for long-running client caches.
//!
//! An [`IdleMonitor`] listens for interaction signals on an [`ActivityTarget`]
//! and, once the session has been idle past a threshold, asks a
//! [`CacheEvictor`] to drop unreferenced entries.

pub mod backend;
pub mod clock;
pub mod config;
pub mod domain;
pub mod evict;
pub mod monitor;

pub use backend::ActivityHub;
pub use backend::ActivitySource;
pub use backend::ActivityTarget;
pub use clock::Clock;
pub use config::Config;
pub use config::ConfigError;
pub use domain::ACTIVITY_KINDS;
pub use domain::ActivityKind;
pub use evict::CacheEvictor;
pub use evict::EvictError;
pub use monitor::IdleMonitor;
pub use monitor::MonitorError;
pub use monitor::MonitorOptions;
pub use monitor::MonitorSnapshot;
