//! Dashboard composition root
//!
//! Owns every component the report page needs and binds user actions
//! (trigger, cancel, dismiss, toggles) to them. A renderer only ever reads
//! `Dashboard::snapshot`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::client::{ApiClient, DashboardApi, ProgressSource};
use crate::config::Config;
use crate::error::Result;
use crate::log_panel::{ActivityEntry, ActivityLog};
use crate::preferences::{Language, PreferenceStore, Preferences, Theme};
use crate::status::{StatusMonitor, StatusView};
use crate::tracker::{Notice, ProgressSnapshot, ProgressTracker, TrackerSettings};
use crate::transport::protocol::{CONNECTED, REPORT_COMPLETED};
use crate::transport::{ConnectionState, Registration, TransportClient, TransportStatus};
use crate::types::{ReportCompleted, TriggerResponse};

/// The "generate report" button: busy while a job is being started or tracked
#[derive(Debug, Clone, Default)]
pub struct TriggerControl {
    busy: Arc<AtomicBool>,
}

impl TriggerControl {
    /// Claim the control; false if it is already busy
    pub fn try_begin(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    /// Back to the ready state
    pub fn restore(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &'static str {
        if self.is_ready() {
            "Generate report"
        } else {
            "Generating report..."
        }
    }
}

/// Connection indicator shown next to the status panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    #[default]
    Connecting,
    Realtime,
    Polling,
}

impl ConnectionMode {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionMode::Connecting => "Connecting...",
            ConnectionMode::Realtime => "Real-time (WebSocket)",
            ConnectionMode::Polling => "Polling (Fallback)",
        }
    }
}

/// Everything a renderer needs for one frame
#[derive(Debug, Clone)]
pub struct DashboardSnapshot {
    pub progress: ProgressSnapshot,
    pub status: Option<StatusView>,
    pub activity: Vec<ActivityEntry>,
    pub activity_indicator: bool,
    pub trigger_ready: bool,
    pub trigger_label: &'static str,
    pub connection: ConnectionMode,
    pub transport: TransportStatus,
    pub preferences: Preferences,
}

pub struct Dashboard {
    config: Config,
    activity: ActivityLog,
    transport: TransportClient,
    api: Arc<dyn DashboardApi>,
    tracker: ProgressTracker,
    status: StatusMonitor,
    trigger: TriggerControl,
    preferences: PreferenceStore,
    connection: Arc<Mutex<ConnectionMode>>,
    registrations: Mutex<Vec<Registration>>,
    initialized: AtomicBool,
}

impl Dashboard {
    /// Production wiring: reqwest API client and WebSocket transport
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let preferences = PreferenceStore::open(config.preferences_path.clone());
        let transport =
            TransportClient::from_config(&config).with_client_id(preferences.get().client_id);
        let api = Arc::new(ApiClient::from_config(&config));
        Self::with_parts(config, transport, api, preferences)
    }

    /// Wire the dashboard around caller-supplied transport and API
    pub fn with_parts<A: DashboardApi>(
        config: Config,
        transport: TransportClient,
        api: Arc<A>,
        preferences: PreferenceStore,
    ) -> Result<Self> {
        // Zero intervals would panic once the loops start
        config.validate()?;
        let activity = ActivityLog::new(config.activity_log_capacity);
        let trigger = TriggerControl::default();
        let source: Arc<dyn ProgressSource> = Arc::clone(&api) as Arc<dyn ProgressSource>;
        let api: Arc<dyn DashboardApi> = api;
        let tracker = ProgressTracker::new(
            transport.clone(),
            source,
            activity.clone(),
            trigger.clone(),
            TrackerSettings::from_config(&config),
        );
        let status = StatusMonitor::new(
            Arc::clone(&api),
            activity.clone(),
            config.status_refresh_interval,
        );

        Ok(Self {
            config,
            activity,
            transport,
            api,
            tracker,
            status,
            trigger,
            preferences,
            connection: Arc::new(Mutex::new(ConnectionMode::Connecting)),
            registrations: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Start everything; later calls do nothing
    pub async fn init(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("dashboard already initialized");
            return;
        }
        info!(base_url = %self.config.base_url, ws_url = %self.config.ws_url, "dashboard starting");
        self.activity.success("🚀 Dashboard started");

        let _ = self.status.refresh().await;
        self.status.start_auto_refresh();

        let registrations = vec![
            self.watch_connection(),
            self.watch_completed_reports(),
            self.watch_client_id(),
        ];
        lock(&self.registrations).extend(registrations);

        self.transport.connect().await;
    }

    fn watch_connection(&self) -> Registration {
        let activity = self.activity.clone();
        let mode = Arc::clone(&self.connection);
        self.transport.on_connection_change(move |state, reason| {
            let set = |m: ConnectionMode| *lock(&mode) = m;
            match state {
                ConnectionState::Connecting => {}
                ConnectionState::Connected => {
                    set(ConnectionMode::Realtime);
                    activity.success("🔗 Real-time connection established, live updates active");
                }
                ConnectionState::Disconnected => {
                    activity.warning("⚠️ Real-time connection lost, attempting to reconnect");
                }
                ConnectionState::Error => {
                    set(ConnectionMode::Polling);
                    activity.error(format!(
                        "❌ Real-time connection error: {}",
                        reason.unwrap_or("Connection failed")
                    ));
                }
                ConnectionState::MaxReconnectAttempts => {
                    set(ConnectionMode::Polling);
                    activity.warning("🔄 Reconnect attempts exhausted, using polling fallback");
                }
            }
        })
    }

    fn watch_completed_reports(&self) -> Registration {
        let activity = self.activity.clone();
        let status = self.status.clone();
        self.transport.on_message(REPORT_COMPLETED, move |data| {
            let completed: ReportCompleted = serde_json::from_value(data.clone())?;
            info!(report_id = %completed.data.id, "report completed");
            activity.success(format!(
                "📊 New report completed: Report #{}",
                completed.data.id
            ));
            let status = status.clone();
            tokio::spawn(async move {
                let _ = status.refresh().await;
            });
            Ok(())
        })
    }

    fn watch_client_id(&self) -> Registration {
        let preferences = self.preferences.clone();
        self.transport.on_message(CONNECTED, move |data| {
            let client_id = data
                .get("client_id")
                .and_then(serde_json::Value::as_str)
                .map(ToString::to_string);
            if client_id.is_some() && client_id != preferences.get().client_id {
                preferences.update(|p| p.client_id = client_id);
            }
            Ok(())
        })
    }

    /// Start a report job and track it. Returns the session id when tracking began.
    pub async fn trigger_report(&self) -> Option<String> {
        if !self.trigger.try_begin() {
            debug!("trigger busy, ignoring");
            return None;
        }
        self.activity.info("🚀 Starting report generation");

        match self.api.trigger_report().await {
            Ok(TriggerResponse {
                success: true,
                session_id: Some(session_id),
                ..
            }) => {
                info!(%session_id, "report job started");
                self.activity
                    .info(format!("📡 Tracking report workflow: {session_id}"));
                self.tracker.start_tracking(session_id.clone());
                self.activity.success("✅ Report workflow launched");
                Some(session_id)
            }
            Ok(response) => {
                let message = response
                    .message
                    .unwrap_or_else(|| "The server did not start a report job".to_string());
                warn!(%message, "report trigger rejected");
                self.activity
                    .error(format!("❌ Report workflow error: {message}"));
                self.fail_trigger(message);
                None
            }
            Err(e) => {
                let message = format!("Connection error while starting the report workflow: {e}");
                warn!(error = %e, "report trigger failed");
                self.activity.error(format!("🔌 {message}"));
                self.fail_trigger(message);
                None
            }
        }
    }

    fn fail_trigger(&self, message: String) {
        self.tracker.show_notice(Notice::Error(message));
        self.trigger.restore();
    }

    /// User cancel; false when nothing is being tracked
    pub fn cancel_progress(&self) -> bool {
        if self.tracker.session_id().is_none() {
            return false;
        }
        self.activity.info("🛑 Report workflow stopped by user");
        self.tracker.cancel_tracking();
        true
    }

    pub async fn close_success_notice(&self) {
        self.tracker.dismiss_notice();
        self.tracker.stop_tracking();
        // Picks up the new report count
        let _ = self.status.refresh().await;
    }

    pub fn close_error_notice(&self) {
        self.tracker.dismiss_notice();
        self.tracker.stop_tracking();
    }

    /// Log the jump and return the home page URL, where the newest report is listed
    pub fn view_latest_report(&self) -> String {
        self.activity.info("📄 Opening the home page to view the latest report");
        format!("{}/", self.config.base_url.trim_end_matches('/'))
    }

    pub fn clear_log(&self) {
        self.activity.clear();
    }

    pub async fn refresh_status(&self) -> Result<StatusView> {
        self.status.refresh().await
    }

    pub fn toggle_theme(&self) -> Theme {
        let theme = self.preferences.update(|p| p.theme = p.theme.toggled()).theme;
        debug!(theme = theme.as_str(), "theme changed");
        theme
    }

    pub fn toggle_language(&self) -> Language {
        let language = self
            .preferences
            .update(|p| p.language = p.language.toggled())
            .language;
        debug!(language = language.code(), "language changed");
        language
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        *lock(&self.connection)
    }

    /// Tear down every background task and handler
    pub fn shutdown(&self) {
        self.tracker.stop_tracking();
        self.status.stop_auto_refresh();
        for registration in lock(&self.registrations).drain(..) {
            registration.cancel();
        }
        self.transport.disconnect();
        info!("dashboard stopped");
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            progress: self.tracker.snapshot(),
            status: self.status.view(),
            activity: self.activity.entries(),
            activity_indicator: self.activity.has_new_entries_indicator(),
            trigger_ready: self.trigger.is_ready(),
            trigger_label: self.trigger.label(),
            connection: self.connection_mode(),
            transport: self.transport.status(),
            preferences: self.preferences.get(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn status_monitor(&self) -> &StatusMonitor {
        &self.status
    }

    pub fn trigger(&self) -> &TriggerControl {
        &self.trigger
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
