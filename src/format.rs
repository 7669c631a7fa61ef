//! Display formatting for progress labels and step-queue lines
//!
//! Purely cosmetic: strips the `[HH:MM:SS]` prefix the workflow stamps on its
//! messages, decorates known step/detail names, and classifies detail lines.
//! Dedup keys are always built from the raw, untransformed strings.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{LogEntry, LogEntryKind};

static TIMESTAMP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]\s*").expect("static regex"));

/// Workflow node names as emitted by the current pipeline
const STEP_LABELS: &[(&str, &str)] = &[
    ("prepare_data", "📋 Preparing data"),
    ("research_deep", "🔬 Deep research + validation"),
    ("validate_report", "✅ Checking results"),
    ("create_interface", "🎨 Building interface"),
    ("extract_code", "📄 Extracting source"),
    ("save_database", "💾 Saving report"),
];

/// Older step names (including the Vietnamese ones still sent by the legacy workflow)
const LEGACY_STEP_LABELS: &[(&str, &str)] = &[
    ("Research + Validation", "🔬 Deep research + validation"),
    ("Parse validation", "✅ Checking results"),
    ("Chuẩn bị dữ liệu", "📋 Preparing data"),
    ("Tạo giao diện", "🎨 Building interface"),
    ("Trích xuất mã nguồn", "📄 Extracting source"),
    ("Lưu báo cáo", "💾 Saving report"),
];

const DETAIL_LABELS: &[(&str, &str)] = &[
    ("inject real-time data", "📊 Injected real-time data"),
    ("Combined Research + Validation", "🔬 Combined Research + Validation"),
    ("Combined response", "📝 Combined response"),
    ("Parse validation", "✅ Checking results"),
    ("Parsed validation result", "✅ Parsed validation result"),
    ("PASS", "✅ PASS"),
    ("FAIL", "❌ FAIL"),
    ("UNKNOWN", "⚠️ UNKNOWN"),
    ("Chuẩn bị dữ liệu", "📋 Preparing data"),
    ("Nghiên cứu sâu", "🔬 Deep research"),
    ("Tạo giao diện", "🎨 Building interface"),
    ("Trích xuất mã nguồn", "📄 Extracting source"),
    ("Lưu báo cáo", "💾 Saving report"),
];

// Checked in this order; first hit wins.
const ERROR_MARKERS: &[&str] = &["✗", "Lỗi", "thất bại", "FAIL"];
const SUCCESS_MARKERS: &[&str] = &["✓", "Hoàn thành", "thành công", "PASS"];
const INFO_MARKERS: &[&str] = &["⚠️", "UNKNOWN", "🔬", "📊", "📝"];

/// Visual class of a progress-log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogClass {
    Success,
    Error,
    Info,
    StepComplete,
}

impl LogClass {
    /// CSS class used by the dashboard stylesheet
    pub fn css_class(self) -> &'static str {
        match self {
            LogClass::Success => "log-success",
            LogClass::Error => "log-error",
            LogClass::Info => "log-info",
            LogClass::StepComplete => "log-step-complete",
        }
    }
}

/// A rendered progress-log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub class: LogClass,
    pub text: String,
}

impl ProgressLine {
    pub fn new(class: LogClass, text: impl Into<String>) -> Self {
        Self {
            class,
            text: text.into(),
        }
    }
}

/// Drop a leading `[HH:MM:SS]` token and the whitespace after it
pub fn strip_timestamp(text: &str) -> &str {
    TIMESTAMP_PREFIX
        .find(text)
        .map_or(text, |m| &text[m.end()..])
}

/// Decorate a step name (current names first, then legacy names)
pub fn format_step_name(text: &str) -> String {
    let decorated = apply_labels(text, STEP_LABELS);
    apply_labels(&decorated, LEGACY_STEP_LABELS)
}

/// Decorate a detail message
pub fn format_detail(text: &str) -> String {
    apply_labels(text, DETAIL_LABELS)
}

/// Classify an already formatted detail message
pub fn classify_detail(text: &str) -> LogClass {
    let has_any = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if has_any(ERROR_MARKERS) {
        LogClass::Error
    } else if has_any(SUCCESS_MARKERS) {
        LogClass::Success
    } else if has_any(INFO_MARKERS) {
        LogClass::Info
    } else {
        LogClass::StepComplete
    }
}

/// Turn a step-queue entry into a display line; unknown kinds render nothing
pub fn render_entry(entry: &LogEntry) -> Option<ProgressLine> {
    let clean = strip_timestamp(&entry.details);
    match entry.kind {
        LogEntryKind::Step => Some(ProgressLine::new(LogClass::Info, format_step_name(clean))),
        LogEntryKind::Detail => {
            let text = format_detail(clean);
            let class = classify_detail(&text);
            Some(ProgressLine::new(class, format!("📋 {text}")))
        }
        LogEntryKind::Other => None,
    }
}

/// Replace the first occurrence of each known key, in table order
fn apply_labels(text: &str, table: &[(&str, &str)]) -> String {
    table.iter().fold(text.to_string(), |acc, (key, label)| {
        if acc.contains(key) {
            acc.replacen(key, label, 1)
        } else {
            acc
        }
    })
}
