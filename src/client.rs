//! Dashboard REST API client
//!
//! Implements the endpoints the dashboard page talks to:
//! - Report job progress (`GET /api/progress/{session_id}`)
//! - Scheduler status (`GET /scheduler-status`)
//! - Manual report trigger (`POST /generate-auto-report`)
//!
//! Also hosts `Poller`, the fixed-period loop used for the polling fallback
//! and the status auto refresh.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::types::{ProgressResponse, ProgressUpdate, SchedulerStatus, TriggerResponse};

/// Source of progress snapshots for the polling fallback
pub trait ProgressSource: Send + Sync + 'static {
    /// Current state of `session_id`; `None` on any failure (already logged)
    fn fetch_progress(&self, session_id: &str) -> BoxFuture<'static, Option<ProgressUpdate>>;
}

/// Everything the dashboard controller needs from the server
pub trait DashboardApi: ProgressSource {
    fn scheduler_status(&self) -> BoxFuture<'static, Result<SchedulerStatus>>;
    fn trigger_report(&self) -> BoxFuture<'static, Result<TriggerResponse>>;
}

/// Dashboard API client
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create new client against `base_url` (trailing slash is ignored)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.base_url.clone())
    }

    fn progress_url(&self, session_id: &str) -> String {
        format!("{}/api/progress/{session_id}", self.base_url)
    }

    fn status_url(&self) -> String {
        format!("{}/scheduler-status", self.base_url)
    }

    fn trigger_url(&self) -> String {
        format!("{}/generate-auto-report", self.base_url)
    }

    /// Perform GET request
    async fn get<T: DeserializeOwned>(http: reqwest::Client, url: String) -> Result<T> {
        let response = http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Handle API response, checking for errors
    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            return Err(TrackerError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        response.json().await.map_err(TrackerError::from)
    }
}

/// Unwrap a progress response body; failures are logged, never raised
fn progress_from_response(
    session_id: &str,
    response: Result<ProgressResponse>,
) -> Option<ProgressUpdate> {
    match response {
        Ok(body) if body.success => body.progress,
        Ok(body) => {
            warn!(%session_id, error = ?body.error, "progress request unsuccessful");
            None
        }
        Err(e) => {
            warn!(%session_id, error = %e, "progress fetch error");
            None
        }
    }
}

impl ProgressSource for ApiClient {
    fn fetch_progress(&self, session_id: &str) -> BoxFuture<'static, Option<ProgressUpdate>> {
        let http = self.http.clone();
        let url = self.progress_url(session_id);
        let session_id = session_id.to_string();
        Box::pin(async move {
            debug!(%session_id, "polling progress");
            let response = Self::get::<ProgressResponse>(http, url).await;
            progress_from_response(&session_id, response)
        })
    }
}

impl DashboardApi for ApiClient {
    fn scheduler_status(&self) -> BoxFuture<'static, Result<SchedulerStatus>> {
        let http = self.http.clone();
        let url = self.status_url();
        Box::pin(async move {
            let status = Self::get(http, url).await;
            if let Err(e) = &status {
                warn!(error = %e, "status fetch error");
            }
            status
        })
    }

    fn trigger_report(&self) -> BoxFuture<'static, Result<TriggerResponse>> {
        let http = self.http.clone();
        let url = self.trigger_url();
        Box::pin(async move {
            let response = http
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "report trigger error");
                    TrackerError::from(e)
                })?;
            Self::handle_response(response).await
        })
    }
}

/// A fixed-period background loop. The first tick fires one period after
/// spawning; the loop ends when the callback breaks or the handle is stopped
/// or dropped.
#[derive(Debug)]
pub struct Poller {
    task: JoinHandle<()>,
}

impl Poller {
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tick().await.is_break() {
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
