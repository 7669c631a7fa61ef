//! Scheduler status panel
//!
//! Fetches `/scheduler-status`, keeps the last good view for the renderer and
//! refreshes it on a fixed period.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime};
use tracing::{info, warn};

use crate::client::{DashboardApi, Poller};
use crate::error::Result;
use crate::log_panel::ActivityLog;
use crate::types::SchedulerStatus;

/// Renderable scheduler status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub active: bool,
    pub status_label: String,
    pub interval_label: String,
    pub api_key_configured: bool,
    pub api_key_label: String,
    pub total_reports: u64,
    pub latest_report_label: String,
}

impl From<&SchedulerStatus> for StatusView {
    fn from(status: &SchedulerStatus) -> Self {
        let active = status.is_active();
        Self {
            active,
            status_label: if active { "Active" } else { "Inactive" }.to_string(),
            interval_label: format!("{} hours", status.interval_hours),
            api_key_configured: status.has_api_key,
            api_key_label: if status.has_api_key {
                "Configured"
            } else {
                "Not configured"
            }
            .to_string(),
            total_reports: status.total_reports,
            latest_report_label: status
                .latest_report_time
                .as_deref()
                .map_or_else(|| "No reports yet".to_string(), format_report_time),
        }
    }
}

/// `dd/mm/yyyy HH:MM:SS` for ISO timestamps; anything else is shown as sent
fn format_report_time(raw: &str) -> String {
    const DISPLAY: &str = "%d/%m/%Y %H:%M:%S";
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.format(DISPLAY).to_string();
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_or_else(|_| raw.to_string(), |dt| dt.format(DISPLAY).to_string())
}

/// Scheduler status monitor; clones share state
#[derive(Clone)]
pub struct StatusMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    api: Arc<dyn DashboardApi>,
    activity: ActivityLog,
    period: Duration,
    view: Mutex<Option<StatusView>>,
    refresher: Mutex<Option<Poller>>,
}

impl StatusMonitor {
    pub fn new(api: Arc<dyn DashboardApi>, activity: ActivityLog, period: Duration) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                api,
                activity,
                period,
                view: Mutex::new(None),
                refresher: Mutex::new(None),
            }),
        }
    }

    /// Fetch once; the outcome lands in the activity log either way
    pub async fn refresh(&self) -> Result<StatusView> {
        match self.inner.api.scheduler_status().await {
            Ok(status) => {
                let view = StatusView::from(&status);
                *lock(&self.inner.view) = Some(view.clone());
                info!(status = %status.status, total_reports = status.total_reports, "status updated");
                self.inner
                    .activity
                    .info(format!("Status updated: {}", status.status));
                Ok(view)
            }
            Err(e) => {
                warn!(error = %e, "status refresh failed");
                self.inner
                    .activity
                    .error(format!("Failed to load status: {e}"));
                Err(e)
            }
        }
    }

    /// Refresh every period, replacing any loop already running
    pub fn start_auto_refresh(&self) {
        let weak = Arc::downgrade(&self.inner);
        let poller = Poller::spawn(self.inner.period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                // Errors are already logged
                let _ = StatusMonitor { inner }.refresh().await;
                ControlFlow::Continue(())
            }
        });
        *lock(&self.inner.refresher) = Some(poller);
    }

    pub fn stop_auto_refresh(&self) {
        if let Some(poller) = lock(&self.inner.refresher).take() {
            poller.stop();
        }
    }

    pub fn is_auto_refreshing(&self) -> bool {
        lock(&self.inner.refresher)
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    /// Last successfully loaded view
    pub fn view(&self) -> Option<StatusView> {
        lock(&self.inner.view).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
