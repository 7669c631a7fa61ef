//! Real-time channel wire format
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Welcome frame; also re-dispatched to handlers once the client id is stored
pub const CONNECTED: &str = "connected";
/// Server push: job progress for one session
pub const PROGRESS_UPDATE: &str = "progress_update";
/// Server push: scheduler status changed
pub const STATUS_UPDATE: &str = "status_update";
/// Server push: a report finished
pub const REPORT_COMPLETED: &str = "report_completed";

/// Channel carrying a session's progress
pub fn progress_channel(session_id: &str) -> String {
    format!("progress_{session_id}")
}

/// Frames the client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Raw inbound frame
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound frame after routing lifecycle events out of the data stream
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Welcome message carrying the server-assigned client id
    Connected { client_id: Option<String> },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Pong { timestamp: Option<String> },
    Error { message: String },
    /// Anything else goes to the registered message handlers
    Message { event: String, data: Value },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_event(self) -> ServerEvent {
        let field = |data: &Value, key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };

        match self.event.as_str() {
            CONNECTED => ServerEvent::Connected {
                client_id: field(&self.data, "client_id"),
            },
            "subscribed" => ServerEvent::Subscribed {
                channel: field(&self.data, "channel").unwrap_or_default(),
            },
            "unsubscribed" => ServerEvent::Unsubscribed {
                channel: field(&self.data, "channel").unwrap_or_default(),
            },
            "pong" => ServerEvent::Pong {
                timestamp: field(&self.data, "timestamp"),
            },
            "error" => ServerEvent::Error {
                message: field(&self.data, "message")
                    .unwrap_or_else(|| self.data.to_string()),
            },
            _ => ServerEvent::Message {
                event: self.event,
                data: self.data,
            },
        }
    }
}
