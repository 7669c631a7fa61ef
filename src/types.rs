//! Common types for the report tracker
//!
//! Payloads exchanged with the dashboard server, over REST and the real-time channel.

use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle status reported by the report job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    #[default]
    Running,
    Completed,
    Error,
}

impl ProgressStatus {
    /// Completed and error end tracking
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Error)
    }
}

/// Kind of a step-queue entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEntryKind {
    Step,
    Detail,
    /// Anything else the server may add; never rendered
    #[serde(other)]
    Other,
}

impl LogEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEntryKind::Step => "step",
            LogEntryKind::Detail => "detail",
            LogEntryKind::Other => "other",
        }
    }
}

/// One line of the job's step queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: LogEntryKind,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
    #[serde(default)]
    pub details: String,
}

/// Snapshot of a running report job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub current_step_name: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub status: ProgressStatus,
    /// Monotonic server timestamp; updates not newer than the last accepted one are dropped
    #[serde(default)]
    pub last_update: f64,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub report_id: Option<String>,
    #[serde(default)]
    pub step_queue: Vec<LogEntry>,
}

impl ProgressUpdate {
    /// Percentage clamped to 0..=100 (NaN reads as 0)
    pub fn clamped_percentage(&self) -> f64 {
        if self.percentage.is_nan() {
            0.0
        } else {
            self.percentage.clamp(0.0, 100.0)
        }
    }
}

/// `GET /api/progress/{session_id}` body
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub progress: Option<ProgressUpdate>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `progress_update` event body; the server nests the update under `data` or `progress`
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressEnvelope {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(alias = "progress")]
    pub data: ProgressUpdate,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `GET /scheduler-status` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    #[serde(default)]
    pub scheduler_enabled: bool,
    #[serde(default)]
    pub has_api_key: bool,
    #[serde(default)]
    pub interval_hours: u32,
    /// "active" or "inactive"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub latest_report_time: Option<String>,
    #[serde(default)]
    pub total_reports: u64,
}

impl SchedulerStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// `POST /generate-auto-report` body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `report_completed` event body
#[derive(Debug, Clone, Deserialize)]
pub struct ReportCompleted {
    pub data: ReportSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_update_from_server_json() {
        let json = r#"{
            "percentage": 42,
            "current_step_name": "[10:00:01] prepare_data",
            "details": "loading",
            "status": "running",
            "last_update": 1712345678.5,
            "report_id": 17,
            "step_queue": [
                {"type": "step", "timestamp": "10:00:01", "details": "prepare_data"},
                {"type": "detail", "timestamp": 1712345678, "details": "PASS"},
                {"type": "heartbeat", "timestamp": "x", "details": ""}
            ]
        }"#;

        let update: ProgressUpdate = serde_json::from_str(json).expect("valid payload");
        assert!((update.percentage - 42.0).abs() < f64::EPSILON);
        assert_eq!(update.report_id.as_deref(), Some("17"));
        assert_eq!(update.step_queue.len(), 3);
        assert_eq!(update.step_queue[1].timestamp, "1712345678");
        assert_eq!(update.step_queue[2].kind, LogEntryKind::Other);
    }

    #[test]
    fn test_progress_update_defaults() {
        let update: ProgressUpdate = serde_json::from_str("{}").expect("empty object");
        assert_eq!(update.status, ProgressStatus::Running);
        assert!(update.last_update.abs() < f64::EPSILON);
        assert!(update.report_id.is_none());
        assert!(update.step_queue.is_empty());
    }

    #[test]
    fn test_clamped_percentage() {
        let mut update = ProgressUpdate {
            percentage: 140.0,
            ..ProgressUpdate::default()
        };
        assert!((update.clamped_percentage() - 100.0).abs() < f64::EPSILON);
        update.percentage = f64::NAN;
        assert!(update.clamped_percentage().abs() < f64::EPSILON);
    }

    #[test]
    fn test_envelope_accepts_both_shapes() {
        let a: ProgressEnvelope =
            serde_json::from_str(r#"{"session_id":"s1","data":{"percentage":10}}"#)
                .expect("data shape");
        let b: ProgressEnvelope =
            serde_json::from_str(r#"{"session_id":"s1","progress":{"percentage":20}}"#)
                .expect("progress shape");
        assert!((a.data.percentage - 10.0).abs() < f64::EPSILON);
        assert!((b.data.percentage - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scheduler_status() {
        let status: SchedulerStatus = serde_json::from_str(
            r#"{"scheduler_enabled":true,"has_api_key":true,"interval_hours":3,
                "status":"active","latest_report_time":null,"total_reports":12}"#,
        )
        .expect("status payload");
        assert!(status.is_active());
        assert_eq!(status.total_reports, 12);
        assert!(ProgressStatus::Error.is_terminal());
        assert!(!ProgressStatus::Running.is_terminal());
    }
}
