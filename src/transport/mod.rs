//! Real-time transport client
//!
//! Keeps at most one live link to the dashboard server, remembers channel
//! subscriptions across reconnects, routes inbound events to registered
//! handlers, and retries dropped connections with exponential backoff until
//! the attempt budget is spent.
//!
//! Failures never surface as errors from `connect`: they are reported to the
//! connection listeners, which is where callers decide to fall back to polling.
//!
//! Everything that spawns (connect, reconnect, keepalive) must run inside a
//! tokio runtime.

mod backoff;
pub mod protocol;
mod ws;

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use backoff::ReconnectPolicy;
pub use ws::{Connector, Link, WsConnector};

use crate::config::Config;
use crate::error::{Result, TrackerError};
use protocol::{ClientMessage, ServerEvent, ServerFrame};

/// Handler for one inbound event type
pub type MessageHandler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Listener for connection state transitions, with an optional reason
pub type ConnectionListener = Arc<dyn Fn(ConnectionState, Option<&str>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    /// Retry budget spent; callers should fall back to polling
    MaxReconnectAttempts,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::MaxReconnectAttempts => "max_reconnect_attempts",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the client
#[derive(Debug, Clone, PartialEq)]
pub struct TransportStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub client_id: Option<String>,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<String>,
    pub last_pong: Option<DateTime<Utc>>,
}

/// Handle returned by `on_message` / `on_connection_change`
#[derive(Debug)]
pub struct Registration {
    inner: Weak<Inner>,
    target: RegistrationTarget,
    id: u64,
}

#[derive(Debug)]
enum RegistrationTarget {
    Message(String),
    Connection,
}

impl Registration {
    /// Remove the handler or listener; later events no longer reach it
    pub fn cancel(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = lock(&inner.state);
        match &self.target {
            RegistrationTarget::Message(event) => {
                if let Some(handlers) = state.handlers.get_mut(event) {
                    handlers.retain(|(id, _)| *id != self.id);
                }
            }
            RegistrationTarget::Connection => {
                state.listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// Real-time client; cheap to clone, all clones share one connection
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Box<dyn Connector>,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    next_id: AtomicU64,
    state: Mutex<State>,
}

struct State {
    connection: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connecting: bool,
    /// Identifies the live link so a stale reader cannot tear down a newer one
    link_id: u64,
    /// Bumped by `disconnect` so in-flight connects are discarded
    epoch: u64,
    auto_reconnect: bool,
    reconnect_attempts: u32,
    subscriptions: BTreeSet<String>,
    handlers: HashMap<String, Vec<(u64, MessageHandler)>>,
    listeners: Vec<(u64, ConnectionListener)>,
    client_id: Option<String>,
    last_pong: Option<DateTime<Utc>>,
    reader_task: Option<JoinHandle<()>>,
    ping_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportClient {
    pub fn new(connector: impl Connector, policy: ReconnectPolicy, ping_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: Box::new(connector),
                policy,
                ping_interval,
                next_id: AtomicU64::new(1),
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    outbound: None,
                    connecting: false,
                    link_id: 0,
                    epoch: 0,
                    auto_reconnect: true,
                    reconnect_attempts: 0,
                    subscriptions: BTreeSet::new(),
                    handlers: HashMap::new(),
                    listeners: Vec::new(),
                    client_id: None,
                    last_pong: None,
                    reader_task: None,
                    ping_task: None,
                    reconnect_task: None,
                }),
            }),
        }
    }

    /// WebSocket client for the configured endpoint
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            WsConnector::new(config.ws_url.clone()),
            ReconnectPolicy::from_config(config),
            config.ping_interval,
        )
    }

    /// Seed the client id remembered from an earlier run
    #[must_use]
    pub fn with_client_id(self, client_id: Option<String>) -> Self {
        lock(&self.inner.state).client_id = client_id;
        self
    }

    /// Open the link. No-op while connected or while another attempt is in flight.
    pub async fn connect(&self) {
        let epoch = {
            let mut state = self.state();
            if state.outbound.is_some() {
                debug!("already connected");
                return;
            }
            if state.connecting {
                return;
            }
            state.connecting = true;
            state.auto_reconnect = true;
            state.connection = ConnectionState::Connecting;
            state.epoch
        };
        info!(attempt = self.reconnect_attempts(), "connecting to server");
        self.notify(ConnectionState::Connecting, None);

        match self.inner.connector.connect().await {
            Ok(link) => self.link_up(link, epoch),
            Err(e) => {
                {
                    let mut state = self.state();
                    state.connecting = false;
                    if state.epoch != epoch {
                        return;
                    }
                    state.connection = ConnectionState::Error;
                }
                error!(error = %e, "connection failed");
                self.notify(ConnectionState::Error, Some(&e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    /// Explicit local teardown: no reconnect, and all subscriptions,
    /// handlers and listeners are forgotten
    pub fn disconnect(&self) {
        let tasks = {
            let mut state = self.state();
            state.auto_reconnect = false;
            state.epoch += 1;
            state.outbound = None;
            state.connecting = false;
            state.connection = ConnectionState::Disconnected;
            state.subscriptions.clear();
            state.handlers.clear();
            state.listeners.clear();
            [
                state.reader_task.take(),
                state.ping_task.take(),
                state.reconnect_task.take(),
            ]
        };
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        info!("manually disconnected");
    }

    /// Track `channel`; sent now if connected, otherwise on the next connect
    pub fn subscribe(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        let outbound = {
            let mut state = self.state();
            state.subscriptions.insert(channel.clone());
            state.outbound.clone()
        };
        match outbound {
            Some(tx) => {
                info!(%channel, "subscribing");
                send_on(&tx, &ClientMessage::Subscribe { channel })
            }
            None => {
                warn!(%channel, "not connected, storing subscription for later");
                Ok(())
            }
        }
    }

    /// Stop tracking `channel`; tells the server if connected
    pub fn unsubscribe(&self, channel: &str) -> Result<()> {
        let outbound = {
            let mut state = self.state();
            state.subscriptions.remove(channel);
            state.outbound.clone()
        };
        match outbound {
            Some(tx) => {
                info!(%channel, "unsubscribing");
                send_on(
                    &tx,
                    &ClientMessage::Unsubscribe {
                        channel: channel.to_string(),
                    },
                )
            }
            None => Ok(()),
        }
    }

    /// Send a frame on the live link
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        let outbound = self.state().outbound.clone();
        match outbound {
            Some(tx) => send_on(&tx, message),
            None => Err(TrackerError::NotConnected),
        }
    }

    /// Register a handler for `event`; handlers run in registration order
    pub fn on_message<F>(&self, event: &str, handler: F) -> Registration
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.state()
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Registration {
            inner: Arc::downgrade(&self.inner),
            target: RegistrationTarget::Message(event.to_string()),
            id,
        }
    }

    /// Register a connection state listener
    pub fn on_connection_change<F>(&self, listener: F) -> Registration
    where
        F: Fn(ConnectionState, Option<&str>) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.state().listeners.push((id, Arc::new(listener)));
        Registration {
            inner: Arc::downgrade(&self.inner),
            target: RegistrationTarget::Connection,
            id,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connection == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state().connection
    }

    pub fn client_id(&self) -> Option<String> {
        self.state().client_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.state().reconnect_attempts
    }

    pub fn status(&self) -> TransportStatus {
        let state = self.state();
        TransportStatus {
            connected: state.connection == ConnectionState::Connected,
            state: state.connection,
            client_id: state.client_id.clone(),
            reconnect_attempts: state.reconnect_attempts,
            subscriptions: state.subscriptions.iter().cloned().collect(),
            last_pong: state.last_pong,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn link_up(&self, link: Link, epoch: u64) {
        let Link { outbound, inbound } = link;
        let link_id = self.next_id();

        let replay: Vec<String> = {
            let mut state = self.state();
            state.connecting = false;
            if state.epoch != epoch {
                debug!("link opened after disconnect, dropping it");
                return;
            }
            state.outbound = Some(outbound.clone());
            state.connection = ConnectionState::Connected;
            state.reconnect_attempts = 0;
            state.link_id = link_id;

            let weak = Arc::downgrade(&self.inner);
            if let Some(old) = state
                .reader_task
                .replace(tokio::spawn(read_loop(weak.clone(), link_id, inbound)))
            {
                old.abort();
            }
            if let Some(old) = state.ping_task.replace(tokio::spawn(ping_loop(
                weak,
                link_id,
                self.inner.ping_interval,
            ))) {
                old.abort();
            }
            state.subscriptions.iter().cloned().collect()
        };

        info!("connected to server");
        self.notify(ConnectionState::Connected, None);

        for channel in replay {
            if let Err(e) = send_on(&outbound, &ClientMessage::Subscribe { channel }) {
                warn!(error = %e, "resubscribe failed");
            }
        }
    }

    fn link_down(&self, link_id: u64, reason: &str) {
        let reconnect = {
            let mut state = self.state();
            if state.link_id != link_id || state.outbound.is_none() {
                return;
            }
            state.outbound = None;
            state.connection = ConnectionState::Disconnected;
            if let Some(task) = state.ping_task.take() {
                task.abort();
            }
            state.auto_reconnect
        };
        info!(%reason, "disconnected");
        self.notify(ConnectionState::Disconnected, Some(reason));
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let next = {
            let mut state = self.state();
            if !state.auto_reconnect {
                return;
            }
            let mut attempts = state.reconnect_attempts;
            let delay = self.inner.policy.next_delay(&mut attempts);
            state.reconnect_attempts = attempts;
            if delay.is_none() {
                state.connection = ConnectionState::MaxReconnectAttempts;
            }
            delay.map(|d| (d, attempts))
        };

        let Some((delay, attempt)) = next else {
            error!("max reconnection attempts reached");
            self.notify(ConnectionState::MaxReconnectAttempts, None);
            return;
        };

        info!(
            attempt,
            max_attempts = self.inner.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                TransportClient { inner }.connect().await;
            }
        });
        // The previous handle may be the task running this very call; let it finish.
        self.state().reconnect_task = Some(task);
    }

    fn handle_frame(&self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "unparseable frame");
                return;
            }
        };

        match frame.into_event() {
            ServerEvent::Connected { client_id } => {
                info!(client_id = ?client_id, "welcome received");
                self.state().client_id.clone_from(&client_id);
                self.dispatch(
                    protocol::CONNECTED,
                    &serde_json::json!({ "client_id": client_id }),
                );
            }
            ServerEvent::Subscribed { channel } => debug!(%channel, "subscribed"),
            ServerEvent::Unsubscribed { channel } => debug!(%channel, "unsubscribed"),
            ServerEvent::Pong { timestamp } => {
                debug!(server_time = ?timestamp, "pong");
                self.state().last_pong = Some(Utc::now());
            }
            ServerEvent::Error { message } => error!(%message, "server error"),
            ServerEvent::Message { event, data } => self.dispatch(&event, &data),
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        let handlers: Vec<MessageHandler> = self
            .state()
            .handlers
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        debug!(%event, handlers = handlers.len(), "received");
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%event, error = %e, "handler error"),
                Err(_) => error!(%event, "handler panicked"),
            }
        }
    }

    fn notify(&self, state: ConnectionState, reason: Option<&str>) {
        let listeners: Vec<ConnectionListener> = self
            .state()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state, reason))).is_err() {
                error!(%state, "connection listener panicked");
            }
        }
    }
}

fn send_on(tx: &mpsc::UnboundedSender<String>, message: &ClientMessage) -> Result<()> {
    let text = message.to_text()?;
    tx.send(text).map_err(|_| TrackerError::NotConnected)
}

async fn read_loop(inner: Weak<Inner>, link_id: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        TransportClient { inner }.handle_frame(&text);
    }
    if let Some(inner) = inner.upgrade() {
        TransportClient { inner }.link_down(link_id, "transport closed");
    }
}

async fn ping_loop(inner: Weak<Inner>, link_id: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let client = TransportClient { inner };
        let outbound = {
            let state = client.state();
            if state.link_id != link_id {
                return;
            }
            state.outbound.clone()
        };
        let Some(tx) = outbound else {
            return;
        };
        if send_on(&tx, &ClientMessage::Ping).is_err() {
            return;
        }
    }
}
