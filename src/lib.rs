//! Report Tracker - progress tracking for the crypto dashboard's report jobs
//!
//! Client library behind the dashboard's "generate report" surface.
//!
//! # Architecture
//! - `Dashboard` is the composition root; hosts render its snapshots
//! - `TransportClient` keeps one real-time link with backoff reconnects
//! - `ApiClient` talks to the REST endpoints and backs the polling fallback
//! - `ProgressTracker` follows one job, over the real-time channel or polling
//!
//! # Features
//! - Out-of-order and duplicate progress updates are dropped
//! - Step-queue lines render once per session into a bounded, scroll-aware log
//! - Scheduler status panel with periodic refresh
//! - Language/theme/client id preferences persisted as JSON

// Clippy configuration for view-model code
#![allow(clippy::cast_precision_loss)] // Pixel math on entry counts
#![allow(clippy::cast_possible_truncation)] // Millisecond durations fit in u64
#![allow(clippy::doc_markdown)] // Doc style flexibility
#![allow(clippy::if_not_else)] // Readability preference
#![allow(clippy::map_unwrap_or)] // Explicit fallback preference

mod client;
mod config;
mod controller;
mod error;
mod format;
mod log_panel;
mod preferences;
mod status;
mod tracker;
pub mod transport;
mod types;

use tracing_subscriber::EnvFilter;

pub use client::{ApiClient, DashboardApi, Poller, ProgressSource};
pub use config::Config;
pub use controller::{ConnectionMode, Dashboard, DashboardSnapshot, TriggerControl};
pub use error::{Result, TrackerError};
pub use format::{LogClass, ProgressLine};
pub use log_panel::{ActivityEntry, ActivityLog, LogPanel, Placement, Severity};
pub use preferences::{Language, PreferenceStore, Preferences, Theme};
pub use status::{StatusMonitor, StatusView};
pub use tracker::{
    Admission, Notice, Phase, ProgressSnapshot, ProgressTracker, SessionProgress,
    TrackerSettings, TrackingMode,
};
pub use transport::{ConnectionState, TransportClient, TransportStatus};
pub use types::*;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `config.log_level` is used. Calling it
/// again (or after another subscriber was installed) is a no-op.
pub fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
