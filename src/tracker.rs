//! Report progress tracker
//!
//! Follows one report job at a time. At start it picks the real-time channel
//! when the transport is connected and falls back to HTTP polling otherwise.
//! A real-time session reads the current state once over HTTP after
//! subscribing, and moves to polling if the transport gives up reconnecting.
//! Inbound snapshots are admitted only
//! when strictly newer than the last accepted one, step-queue lines render at
//! most once per session, and a completed or failed job ends tracking.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Poller, ProgressSource};
use crate::config::Config;
use crate::controller::TriggerControl;
use crate::error::Result;
use crate::format::{LogClass, ProgressLine, render_entry, strip_timestamp};
use crate::log_panel::{ActivityLog, LogPanel, Placement};
use crate::transport::protocol::{self, PROGRESS_UPDATE};
use crate::transport::{ConnectionState, Registration, TransportClient};
use crate::types::{LogEntry, LogEntryKind, ProgressEnvelope, ProgressStatus, ProgressUpdate};

/// How updates reach the tracker for the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    WebSocket,
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Tracking(TrackingMode),
    Completed { report_id: Option<String> },
    Failed { message: String },
    Cancelled,
}

/// Blocking overlay shown to the user at the end of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Error(String),
}

/// What happened to an offered update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Applied {
        status: ProgressStatus,
        new_lines: usize,
    },
    /// Not newer than the last accepted update
    Stale,
    /// No matching session is being tracked
    Inactive,
}

/// Dedup identity of a step-queue line, built from raw strings
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LogKey {
    session_id: String,
    kind: LogEntryKind,
    timestamp: String,
    details: String,
}

impl LogKey {
    fn new(session_id: &str, entry: &LogEntry) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind: entry.kind.clone(),
            timestamp: entry.timestamp.clone(),
            details: entry.details.clone(),
        }
    }
}

/// Display state of one session's progress card
#[derive(Debug, Clone)]
pub struct SessionProgress {
    session_id: String,
    last_update: f64,
    seen: HashSet<LogKey>,
    percentage: f64,
    step_name: String,
    details: String,
    log: LogPanel<ProgressLine>,
}

impl SessionProgress {
    pub fn new(session_id: impl Into<String>, log_capacity: usize) -> Self {
        let mut log = LogPanel::new(log_capacity, Placement::NewestLast);
        log.push(ProgressLine::new(
            LogClass::Info,
            "[Init] 🚀 Starting report workflow",
        ));
        Self {
            session_id: session_id.into(),
            last_update: 0.0,
            seen: HashSet::new(),
            percentage: 0.0,
            step_name: "Initializing...".to_string(),
            details: "Preparing to start the report workflow...".to_string(),
            log,
        }
    }

    /// Apply `update` if it is newer than everything accepted so far
    pub fn admit(&mut self, update: &ProgressUpdate) -> Admission {
        if update.last_update.is_nan() || update.last_update <= self.last_update {
            return Admission::Stale;
        }
        self.last_update = update.last_update;

        self.percentage = update.clamped_percentage();
        self.step_name = strip_timestamp(&update.current_step_name).to_string();
        let details = strip_timestamp(&update.details);
        if !details.is_empty() {
            self.details = details.to_string();
        }

        let mut lines = Vec::new();
        for entry in &update.step_queue {
            let key = LogKey::new(&self.session_id, entry);
            if self.seen.contains(&key) {
                continue;
            }
            if let Some(line) = render_entry(entry) {
                self.seen.insert(key);
                lines.push(line);
            }
        }
        let new_lines = lines.len();
        self.log.extend(lines);

        Admission::Applied {
            status: update.status,
            new_lines,
        }
    }

    fn complete(&mut self, report_id: &str) {
        self.percentage = 100.0;
        self.step_name = "Completed!".to_string();
        self.details = format!("Report #{report_id} was generated successfully");
        self.log.push(ProgressLine::new(
            LogClass::Success,
            format!("🎉 Finished generating report #{report_id}"),
        ));
        self.log.scroll_to_bottom();
    }

    fn fail(&mut self, message: &str) {
        self.step_name = "Error occurred".to_string();
        self.details = message.to_string();
        self.log.push(ProgressLine::new(
            LogClass::Error,
            format!("💥 Workflow error: {message}"),
        ));
        self.log.scroll_to_bottom();
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn log(&self) -> &LogPanel<ProgressLine> {
        &self.log
    }
}

/// Point-in-time view of the progress card
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    /// Session currently being tracked
    pub session_id: Option<String>,
    /// `Session: 1a2b3c4d...`
    pub session_label: Option<String>,
    pub card_visible: bool,
    pub percentage: f64,
    pub step_name: String,
    pub details: String,
    pub log: Vec<ProgressLine>,
    pub new_entries_indicator: bool,
    pub notice: Option<Notice>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub log_capacity: usize,
}

impl TrackerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.progress_poll_interval,
            log_capacity: config.progress_log_capacity,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            log_capacity: 20,
        }
    }
}

/// Progress tracker; clones share state
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    transport: TransportClient,
    source: Arc<dyn ProgressSource>,
    activity: ActivityLog,
    trigger: TriggerControl,
    settings: TrackerSettings,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    /// Bumped on every start; results tagged with an older value are dropped
    generation: u64,
    phase: Phase,
    active: Option<ActiveSession>,
    progress: Option<SessionProgress>,
    notice: Option<Notice>,
    card_visible: bool,
}

struct ActiveSession {
    session_id: String,
    feed: Feed,
}

enum Feed {
    Subscription {
        channel: String,
        registration: Registration,
        /// Moves the session to polling when the transport gives up
        watcher: Registration,
        /// One-shot HTTP read of the state at subscribe time
        catch_up: JoinHandle<()>,
    },
    Polling(Poller),
}

impl ProgressTracker {
    pub fn new(
        transport: TransportClient,
        source: Arc<dyn ProgressSource>,
        activity: ActivityLog,
        trigger: TriggerControl,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                transport,
                source,
                activity,
                trigger,
                settings,
                state: Mutex::new(TrackerState {
                    generation: 0,
                    phase: Phase::Idle,
                    active: None,
                    progress: None,
                    notice: None,
                    card_visible: false,
                }),
            }),
        }
    }

    /// Begin tracking `session_id`, stopping any session already tracked
    pub fn start_tracking(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        self.stop_tracking();

        let use_realtime = self.inner.transport.is_connected();
        let generation = {
            let mut state = self.state();
            state.generation += 1;
            state.phase = Phase::Tracking(if use_realtime {
                TrackingMode::WebSocket
            } else {
                TrackingMode::Polling
            });
            state.progress = Some(SessionProgress::new(
                session_id.clone(),
                self.inner.settings.log_capacity,
            ));
            state.notice = None;
            state.card_visible = true;
            state.generation
        };

        let feed = if use_realtime {
            match self.subscription_feed(&session_id, generation) {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(%session_id, error = %e, "subscription failed, falling back to polling");
                    self.inner
                        .activity
                        .warning("⚠️ Real-time subscription failed, using polling");
                    self.state().phase = Phase::Tracking(TrackingMode::Polling);
                    self.polling_feed(&session_id, generation)
                }
            }
        } else {
            self.polling_feed(&session_id, generation)
        };

        let orphan = {
            let mut state = self.state();
            let still_ours =
                state.generation == generation && matches!(state.phase, Phase::Tracking(_));
            let active = ActiveSession {
                session_id: session_id.clone(),
                feed,
            };
            if still_ours {
                state.active = Some(active);
                None
            } else {
                // Finished before the feed was stored
                Some(active)
            }
        };
        if let Some(active) = orphan {
            self.release(active);
        }

        info!(%session_id, mode = ?self.mode(), "tracking started");
        self.inner.activity.info("📡 Started tracking progress");
    }

    /// Stop the active feed and forget the session; the card stays as it is
    pub fn stop_tracking(&self) {
        let active = {
            let mut state = self.state();
            if matches!(state.phase, Phase::Tracking(_)) {
                state.phase = Phase::Idle;
            }
            state.active.take()
        };
        if let Some(active) = active {
            info!(session_id = %active.session_id, "tracking stopped");
            self.release(active);
            self.inner.activity.info("⏹️ Stopped tracking progress");
        }
    }

    /// User-initiated cancel: stop, hide the card, re-enable the trigger
    pub fn cancel_tracking(&self) {
        self.stop_tracking();
        {
            let mut state = self.state();
            state.phase = Phase::Cancelled;
            state.progress = None;
            state.notice = None;
            state.card_visible = false;
        }
        self.inner.trigger.restore();
    }

    /// Session currently being tracked
    pub fn session_id(&self) -> Option<String> {
        self.state().active.as_ref().map(|a| a.session_id.clone())
    }

    pub fn mode(&self) -> Option<TrackingMode> {
        match self.state().phase {
            Phase::Tracking(mode) => Some(mode),
            _ => None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state().phase.clone()
    }

    /// Raise an overlay that did not come from the job itself
    pub fn show_notice(&self, notice: Notice) {
        self.state().notice = Some(notice);
    }

    /// Close the success/error overlay
    pub fn dismiss_notice(&self) -> Option<Notice> {
        self.state().notice.take()
    }

    /// Viewer scrolled the progress log
    pub fn scroll_log_to(&self, offset: f64) {
        if let Some(progress) = self.state().progress.as_mut() {
            progress.log.scroll_to(offset);
        }
    }

    /// "New progress" indicator clicked
    pub fn jump_log_to_bottom(&self) {
        if let Some(progress) = self.state().progress.as_mut() {
            progress.log.scroll_to_bottom();
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state();
        let session_id = state.active.as_ref().map(|a| a.session_id.clone());
        let progress = state.progress.as_ref();
        ProgressSnapshot {
            phase: state.phase.clone(),
            session_label: progress.map(|p| {
                let short: String = p.session_id.chars().take(8).collect();
                format!("Session: {short}...")
            }),
            session_id,
            card_visible: state.card_visible,
            percentage: progress.map_or(0.0, SessionProgress::percentage),
            step_name: progress.map(|p| p.step_name.clone()).unwrap_or_default(),
            details: progress.map(|p| p.details.clone()).unwrap_or_default(),
            log: progress
                .map(|p| p.log.entries().cloned().collect())
                .unwrap_or_default(),
            new_entries_indicator: progress.is_some_and(|p| p.log.has_new_entries_indicator()),
            notice: state.notice.clone(),
        }
    }

    /// Offer an update produced for `generation`
    fn apply(&self, generation: u64, update: &ProgressUpdate) -> Admission {
        let (admission, finished) = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.generation != generation || !matches!(state.phase, Phase::Tracking(_)) {
                return Admission::Inactive;
            }
            let Some(progress) = state.progress.as_mut() else {
                return Admission::Inactive;
            };

            let admission = progress.admit(update);
            let Admission::Applied { status, .. } = admission else {
                debug!(last_update = update.last_update, "stale update dropped");
                return admission;
            };

            let finished = match status {
                ProgressStatus::Running => None,
                ProgressStatus::Completed => {
                    let report_id = update.report_id.clone();
                    let label = report_id.as_deref().unwrap_or("?");
                    progress.complete(label);
                    state.notice = Some(Notice::Success(format!(
                        "Report #{label} was generated successfully!"
                    )));
                    state.phase = Phase::Completed { report_id };
                    Some((status, state.active.take()))
                }
                ProgressStatus::Error => {
                    let message = if update.details.trim().is_empty() {
                        "An error occurred while generating the report".to_string()
                    } else {
                        strip_timestamp(&update.details).to_string()
                    };
                    progress.fail(&message);
                    state.notice = Some(Notice::Error(message.clone()));
                    state.phase = Phase::Failed { message };
                    Some((status, state.active.take()))
                }
            };
            (admission, finished)
        };

        if let Some((status, active)) = finished {
            if let Some(active) = active {
                self.release(active);
            }
            self.inner.trigger.restore();
            if status == ProgressStatus::Completed {
                info!("report job completed");
                self.inner.activity.success("🎉 Report generation completed!");
            } else {
                warn!("report job failed");
                self.inner.activity.error("💥 Report generation failed!");
            }
        }
        admission
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.state();
        state.generation == generation && matches!(state.phase, Phase::Tracking(_))
    }

    fn subscription_feed(&self, session_id: &str, generation: u64) -> Result<Feed> {
        let weak = Arc::downgrade(&self.inner);
        let expected = session_id.to_string();
        let registration = self
            .inner
            .transport
            .on_message(PROGRESS_UPDATE, move |data| {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let envelope: ProgressEnvelope = serde_json::from_value(data.clone())?;
                if envelope.session_id.as_deref().is_some_and(|id| id != expected) {
                    return Ok(());
                }
                ProgressTracker { inner }.apply(generation, &envelope.data);
                Ok(())
            });

        let channel = protocol::progress_channel(session_id);
        if let Err(e) = self.inner.transport.subscribe(channel.clone()) {
            registration.cancel();
            if let Err(err) = self.inner.transport.unsubscribe(&channel) {
                warn!(%channel, error = %err, "unsubscribe failed");
            }
            return Err(e);
        }

        let weak = Arc::downgrade(&self.inner);
        let watcher = self
            .inner
            .transport
            .on_connection_change(move |state, _reason| {
                if state != ConnectionState::MaxReconnectAttempts {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    ProgressTracker { inner }.fall_back_to_polling(generation);
                }
            });

        // Pushes sent before the subscribe landed are lost; admission drops repeats
        let weak = Arc::downgrade(&self.inner);
        let fetch = self.inner.source.fetch_progress(session_id);
        let catch_up = tokio::spawn(async move {
            let update = fetch.await;
            if let (Some(inner), Some(update)) = (weak.upgrade(), update) {
                ProgressTracker { inner }.apply(generation, &update);
            }
        });

        Ok(Feed::Subscription {
            channel,
            registration,
            watcher,
            catch_up,
        })
    }

    /// Swap a real-time session whose transport gave up for a polling loop
    fn fall_back_to_polling(&self, generation: u64) {
        let replaced = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.generation != generation
                || state.phase != Phase::Tracking(TrackingMode::WebSocket)
            {
                return;
            }
            let Some(active) = state.active.as_mut() else {
                return;
            };
            state.phase = Phase::Tracking(TrackingMode::Polling);
            let feed = self.polling_feed(&active.session_id, generation);
            warn!(session_id = %active.session_id, "real-time link lost, polling instead");
            std::mem::replace(&mut active.feed, feed)
        };
        self.release_feed(replaced);
        self.inner
            .activity
            .warning("⚠️ Real-time connection lost, tracking by polling");
    }

    fn polling_feed(&self, session_id: &str, generation: u64) -> Feed {
        let weak = Arc::downgrade(&self.inner);
        let session_id = session_id.to_string();
        Feed::Polling(Poller::spawn(
            self.inner.settings.poll_interval,
            move || {
                let weak = weak.clone();
                let session_id = session_id.clone();
                async move {
                    let fetch = {
                        let Some(inner) = weak.upgrade() else {
                            return ControlFlow::Break(());
                        };
                        let tracker = ProgressTracker { inner };
                        if !tracker.is_current(generation) {
                            return ControlFlow::Break(());
                        }
                        tracker.inner.source.fetch_progress(&session_id)
                    };

                    let update = fetch.await;

                    let Some(inner) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    let tracker = ProgressTracker { inner };
                    if let Some(update) = update {
                        tracker.apply(generation, &update);
                    }
                    if tracker.is_current(generation) {
                        ControlFlow::Continue(())
                    } else {
                        ControlFlow::Break(())
                    }
                }
            },
        ))
    }

    fn release(&self, active: ActiveSession) {
        self.release_feed(active.feed);
    }

    fn release_feed(&self, feed: Feed) {
        match feed {
            Feed::Subscription {
                channel,
                registration,
                watcher,
                catch_up,
            } => {
                registration.cancel();
                watcher.cancel();
                catch_up.abort();
                if let Err(e) = self.inner.transport.unsubscribe(&channel) {
                    warn!(%channel, error = %e, "unsubscribe failed");
                }
            }
            Feed::Polling(poller) => poller.stop(),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeApi;
    use crate::transport::ReconnectPolicy;
    use crate::transport::fake::FakeConnector;
    use serde_json::json;

    fn update(last_update: f64, percentage: f64) -> ProgressUpdate {
        ProgressUpdate {
            percentage,
            last_update,
            current_step_name: format!("[10:00:00] step at {percentage}"),
            ..ProgressUpdate::default()
        }
    }

    fn detail(timestamp: &str, details: &str) -> LogEntry {
        LogEntry {
            kind: LogEntryKind::Detail,
            timestamp: timestamp.to_string(),
            details: details.to_string(),
        }
    }

    fn completed(last_update: f64, report_id: &str) -> ProgressUpdate {
        ProgressUpdate {
            status: ProgressStatus::Completed,
            report_id: Some(report_id.to_string()),
            ..update(last_update, 100.0)
        }
    }

    struct Harness {
        tracker: ProgressTracker,
        transport: TransportClient,
        source: Arc<FakeApi>,
        activity: ActivityLog,
        trigger: TriggerControl,
    }

    fn harness(connector: FakeConnector, script: Vec<Option<ProgressUpdate>>) -> Harness {
        let transport =
            TransportClient::new(connector, ReconnectPolicy::default(), Duration::from_secs(30));
        let source = Arc::new(FakeApi::with_progress(script));
        let activity = ActivityLog::new(50);
        let trigger = TriggerControl::default();
        let tracker = ProgressTracker::new(
            transport.clone(),
            Arc::clone(&source) as Arc<dyn ProgressSource>,
            activity.clone(),
            trigger.clone(),
            TrackerSettings::default(),
        );
        Harness {
            tracker,
            transport,
            source,
            activity,
            trigger,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_out_of_order_updates_never_regress() {
        let mut progress = SessionProgress::new("s1", 20);
        let mut shown = Vec::new();
        for u in [update(5.0, 40.0), update(3.0, 10.0), update(10.0, 90.0)] {
            if let Admission::Applied { .. } = progress.admit(&u) {
                shown.push(progress.percentage());
            }
        }
        assert_eq!(shown, vec![40.0, 90.0]);
        assert_eq!(progress.step_name(), "step at 90");
        // Equal timestamp is a duplicate
        assert_eq!(progress.admit(&update(10.0, 95.0)), Admission::Stale);
    }

    #[test]
    fn test_step_queue_lines_render_once() {
        let mut progress = SessionProgress::new("s1", 20);
        let queue = vec![detail("10:00:01", "PASS"), detail("10:00:02", "loading")];

        let first = ProgressUpdate {
            step_queue: queue.clone(),
            ..update(1.0, 10.0)
        };
        let second = ProgressUpdate {
            step_queue: queue,
            ..update(2.0, 20.0)
        };
        assert_eq!(
            progress.admit(&first),
            Admission::Applied {
                status: ProgressStatus::Running,
                new_lines: 2
            }
        );
        assert_eq!(
            progress.admit(&second),
            Admission::Applied {
                status: ProgressStatus::Running,
                new_lines: 0
            }
        );
        // Start line + two entries
        assert_eq!(progress.log().len(), 3);
        let texts: Vec<_> = progress.log().entries().map(|l| l.text.clone()).collect();
        assert_eq!(texts[1], "📋 ✅ PASS");
        assert_eq!(progress.log().entries().nth(1).map(|l| l.class), Some(LogClass::Success));
    }

    #[test]
    fn test_evicted_lines_are_not_rendered_again() {
        let mut progress = SessionProgress::new("s1", 20);
        let queue: Vec<LogEntry> = (0..25)
            .map(|i| detail(&format!("t{i}"), &format!("line {i}")))
            .collect();
        progress.admit(&ProgressUpdate {
            step_queue: queue.clone(),
            ..update(1.0, 50.0)
        });
        assert_eq!(progress.log().len(), 20);
        assert_eq!(
            progress.log().entries().next().map(|l| l.text.as_str()),
            Some("📋 line 5")
        );

        let again = progress.admit(&ProgressUpdate {
            step_queue: queue,
            ..update(2.0, 60.0)
        });
        assert_eq!(
            again,
            Admission::Applied {
                status: ProgressStatus::Running,
                new_lines: 0
            }
        );
        assert_eq!(
            progress.log().entries().next().map(|l| l.text.as_str()),
            Some("📋 line 5")
        );
    }

    #[test]
    fn test_dedup_key_uses_raw_details() {
        let mut progress = SessionProgress::new("s1", 20);
        // Same display text after stripping, different raw strings
        let queue = vec![
            detail("t", "[10:00:00] loading"),
            detail("t", "[10:00:05] loading"),
        ];
        progress.admit(&ProgressUpdate {
            step_queue: queue,
            ..update(1.0, 5.0)
        });
        assert_eq!(progress.log().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_fallback_reaches_completion() {
        let (connector, _servers) = FakeConnector::refusing();
        let h = harness(
            connector,
            vec![
                Some(update(1.0, 20.0)),
                None,
                Some(update(2.0, 60.0)),
                Some(completed(3.0, "7")),
                Some(update(4.0, 10.0)),
            ],
        );
        assert!(h.trigger.try_begin());

        h.tracker.start_tracking("abcdef123456");
        assert_eq!(h.tracker.mode(), Some(TrackingMode::Polling));
        assert_eq!(h.tracker.session_id().as_deref(), Some("abcdef123456"));

        tokio::time::sleep(Duration::from_secs(20)).await;

        let snap = h.tracker.snapshot();
        assert_eq!(
            snap.phase,
            Phase::Completed {
                report_id: Some("7".to_string())
            }
        );
        assert!((snap.percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(snap.session_label.as_deref(), Some("Session: abcdef12..."));
        assert!(snap.session_id.is_none());
        assert!(matches!(snap.notice, Some(Notice::Success(ref m)) if m.contains("#7")));
        assert!(snap.log.last().is_some_and(|l| l.class == LogClass::Success));
        assert!(h.trigger.is_ready());
        // Polling stopped at the terminal update
        assert_eq!(h.source.progress_calls().len(), 4);
        assert!(
            h.activity
                .entries()
                .iter()
                .any(|e| e.message.contains("Report generation completed"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_updates_and_error_terminal() {
        let (connector, mut servers) = FakeConnector::accepting();
        let h = harness(connector, Vec::new());
        h.transport.connect().await;
        let mut server = servers.recv().await.expect("link");

        h.tracker.start_tracking("abc");
        assert_eq!(h.tracker.mode(), Some(TrackingMode::WebSocket));
        assert_eq!(
            server.drain(),
            vec![json!({"event": "subscribe", "data": {"channel": "progress_abc"}})]
        );

        let mut shown = Vec::new();
        for (ts, pct) in [(5.0, 40.0), (3.0, 10.0), (10.0, 90.0)] {
            server.push(
                "progress_update",
                &json!({"session_id": "abc", "data": {"percentage": pct, "last_update": ts}}),
            );
            settle().await;
            shown.push(h.tracker.snapshot().percentage);
        }
        assert_eq!(shown, vec![40.0, 40.0, 90.0]);

        // Other sessions on the same event are ignored
        server.push(
            "progress_update",
            &json!({"session_id": "zzz", "data": {"percentage": 1, "last_update": 99}}),
        );
        settle().await;
        assert!((h.tracker.snapshot().percentage - 90.0).abs() < f64::EPSILON);

        server.push(
            "progress_update",
            &json!({"session_id": "abc", "progress": {
                "percentage": 90, "last_update": 11, "status": "error",
                "details": "[10:00:09] LLM quota exceeded"
            }}),
        );
        settle().await;

        let snap = h.tracker.snapshot();
        assert_eq!(
            snap.phase,
            Phase::Failed {
                message: "LLM quota exceeded".to_string()
            }
        );
        assert_eq!(snap.notice, Some(Notice::Error("LLM quota exceeded".to_string())));
        assert_eq!(
            server.drain(),
            vec![json!({"event": "unsubscribe", "data": {"channel": "progress_abc"}})]
        );
        assert!(h.transport.status().subscriptions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_session_reads_current_state_once() {
        let (connector, mut servers) = FakeConnector::accepting();
        let h = harness(connector, vec![Some(completed(4.0, "9"))]);
        h.transport.connect().await;
        let mut server = servers.recv().await.expect("link");

        assert!(h.trigger.try_begin());
        h.tracker.start_tracking("abc");
        settle().await;

        // Job finished before the subscribe; no push will ever arrive
        assert_eq!(
            h.tracker.phase(),
            Phase::Completed {
                report_id: Some("9".to_string())
            }
        );
        assert!(h.trigger.is_ready());
        assert_eq!(h.source.progress_calls(), vec!["abc".to_string()]);
        assert_eq!(
            server.drain(),
            vec![
                json!({"event": "subscribe", "data": {"channel": "progress_abc"}}),
                json!({"event": "unsubscribe", "data": {"channel": "progress_abc"}}),
            ]
        );

        // No polling loop behind a real-time session
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.source.progress_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_session_polls_after_transport_gives_up() {
        let (connector, mut servers) = FakeConnector::new(&[true], false);
        let h = harness(connector, vec![None, Some(completed(2.0, "5"))]);
        h.transport.connect().await;
        let server = servers.recv().await.expect("link");

        assert!(h.trigger.try_begin());
        h.tracker.start_tracking("abc");
        assert_eq!(h.tracker.mode(), Some(TrackingMode::WebSocket));

        drop(server);
        tokio::time::sleep(Duration::from_secs(20)).await;
        // Still retrying; the session keeps its real-time feed
        assert_eq!(h.tracker.mode(), Some(TrackingMode::WebSocket));

        tokio::time::sleep(Duration::from_secs(280)).await;
        assert_eq!(
            h.transport.connection_state(),
            ConnectionState::MaxReconnectAttempts
        );
        assert_eq!(
            h.tracker.phase(),
            Phase::Completed {
                report_id: Some("5".to_string())
            }
        );
        assert!(h.trigger.is_ready());
        // Catch-up read plus one poll, which ended the session
        assert_eq!(h.source.progress_calls().len(), 2);
        assert!(h.transport.status().subscriptions.is_empty());
        assert!(
            h.activity
                .entries()
                .iter()
                .any(|e| e.message.contains("tracking by polling"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_give_up_does_not_touch_newer_session() {
        let (connector, mut servers) = FakeConnector::new(&[true], false);
        let h = harness(connector, Vec::new());
        h.transport.connect().await;
        let _server = servers.recv().await.expect("link");

        h.tracker.start_tracking("a");
        let old_generation = h.tracker.state().generation;
        h.tracker.start_tracking("b");

        h.tracker.fall_back_to_polling(old_generation);
        assert_eq!(h.tracker.mode(), Some(TrackingMode::WebSocket));
        assert_eq!(h.transport.status().subscriptions, vec!["progress_b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_falls_back_to_polling() {
        let (connector, mut servers) = FakeConnector::accepting();
        let h = harness(connector, vec![Some(completed(1.0, "3"))]);
        h.transport.connect().await;
        let server = servers.recv().await.expect("link");
        // Outbound side gone while the link still looks connected
        drop(server.from_client);
        assert!(h.transport.is_connected());

        h.tracker.start_tracking("abc");
        assert_eq!(h.tracker.mode(), Some(TrackingMode::Polling));
        assert!(h.transport.status().subscriptions.is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(matches!(h.tracker.phase(), Phase::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_everything() {
        let (connector, _servers) = FakeConnector::refusing();
        let h = harness(
            connector,
            vec![
                Some(ProgressUpdate {
                    step_queue: vec![detail("t1", "first")],
                    ..update(1.0, 30.0)
                }),
                Some(ProgressUpdate {
                    step_queue: vec![detail("t2", "second")],
                    ..update(2.0, 40.0)
                }),
            ],
        );
        assert!(h.trigger.try_begin());
        h.tracker.start_tracking("abc");
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(h.tracker.snapshot().log.len(), 2);

        h.tracker.cancel_tracking();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let snap = h.tracker.snapshot();
        assert_eq!(snap.phase, Phase::Cancelled);
        assert!(!snap.card_visible);
        assert!(snap.log.is_empty());
        assert!(h.trigger.is_ready());
        assert_eq!(h.source.progress_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_stops_previous_session_first() {
        let (connector, mut servers) = FakeConnector::accepting();
        let h = harness(connector, Vec::new());
        h.transport.connect().await;
        let mut server = servers.recv().await.expect("link");

        h.tracker.start_tracking("a");
        let old_generation = h.tracker.state().generation;
        h.tracker.start_tracking("b");

        assert_eq!(
            server.drain(),
            vec![
                json!({"event": "subscribe", "data": {"channel": "progress_a"}}),
                json!({"event": "unsubscribe", "data": {"channel": "progress_a"}}),
                json!({"event": "subscribe", "data": {"channel": "progress_b"}}),
            ]
        );
        assert_eq!(h.transport.status().subscriptions, vec!["progress_b".to_string()]);

        // A late result for the replaced session is discarded
        assert_eq!(
            h.tracker.apply(old_generation, &update(50.0, 77.0)),
            Admission::Inactive
        );
        assert!(h.tracker.snapshot().percentage.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_in_polling_mode_keeps_one_loop() {
        let (connector, _servers) = FakeConnector::refusing();
        let h = harness(connector, Vec::new());
        h.tracker.start_tracking("a");
        h.tracker.start_tracking("b");
        tokio::time::sleep(Duration::from_millis(4_500)).await;

        let calls = h.source.progress_calls();
        assert_eq!(calls, vec!["b".to_string(), "b".to_string()]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // (last_update, percentage, step queue of (timestamp, details) indices)
        fn updates() -> impl Strategy<Value = Vec<(u8, f64, Vec<(u8, u8)>)>> {
            prop::collection::vec(
                (
                    0u8..40,
                    -20.0f64..120.0,
                    prop::collection::vec((0u8..6, 0u8..4), 0..6),
                ),
                0..30,
            )
        }

        fn to_update(last_update: u8, percentage: f64, queue: &[(u8, u8)]) -> ProgressUpdate {
            ProgressUpdate {
                step_queue: queue
                    .iter()
                    .map(|(ts, d)| detail(&format!("t{ts}"), &format!("entry {d}")))
                    .collect(),
                ..update(f64::from(last_update), percentage)
            }
        }

        proptest! {
            #[test]
            fn displayed_update_is_the_newest_seen(seq in updates()) {
                let mut progress = SessionProgress::new("s", 20);
                let mut newest = 0.0f64;
                let mut expected = 0.0f64;
                for (lu, pct, queue) in &seq {
                    let admission = progress.admit(&to_update(*lu, *pct, queue));
                    let lu = f64::from(*lu);
                    if lu > newest {
                        newest = lu;
                        expected = pct.clamp(0.0, 100.0);
                        prop_assert!(matches!(admission, Admission::Applied { .. }), "expected Applied, got {:?}", admission);
                    } else {
                        prop_assert_eq!(admission, Admission::Stale);
                    }
                    prop_assert!((progress.percentage() - expected).abs() < f64::EPSILON);
                }
            }

            #[test]
            fn each_step_line_renders_once_within_capacity(
                seq in updates(),
                capacity in 1usize..12,
            ) {
                let mut progress = SessionProgress::new("s", capacity);
                let mut newest = 0u8;
                let mut keys = HashSet::new();
                let mut rendered = 0;
                for (lu, pct, queue) in &seq {
                    if let Admission::Applied { new_lines, .. } =
                        progress.admit(&to_update(*lu, *pct, queue))
                    {
                        prop_assert!(*lu > newest);
                        newest = *lu;
                        keys.extend(queue.iter().copied());
                        rendered += new_lines;
                    }
                    prop_assert!(progress.log().len() <= capacity);
                }
                prop_assert_eq!(rendered, keys.len());
            }
        }
    }
}
