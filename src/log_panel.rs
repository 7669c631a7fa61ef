//! Bounded, scroll-aware log panels
//!
//! `LogPanel` models a scrollable list capped at a fixed number of entries.
//! It remembers whether the viewer was parked at the bottom before each batch
//! of new entries: if so it follows the bottom, otherwise it leaves the scroll
//! offset alone and raises a "new entries" indicator.
//!
//! `ActivityLog` is the shared dashboard activity panel built on top of it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};

/// Pixel slack when deciding whether the viewer sits at the bottom
pub const BOTTOM_TOLERANCE_PX: f64 = 5.0;

const DEFAULT_LINE_HEIGHT_PX: f64 = 20.0;
const DEFAULT_CLIENT_HEIGHT_PX: f64 = 200.0;

/// Where new entries land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Appended at the bottom; oldest evicted from the top
    NewestLast,
    /// Inserted at the top; oldest evicted from the bottom
    NewestFirst,
}

/// A bounded list with viewer scroll state
#[derive(Debug, Clone)]
pub struct LogPanel<T> {
    entries: VecDeque<T>,
    capacity: usize,
    placement: Placement,
    line_height: f64,
    client_height: f64,
    scroll_top: f64,
    indicator: bool,
}

impl<T> LogPanel<T> {
    pub fn new(capacity: usize, placement: Placement) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            placement,
            line_height: DEFAULT_LINE_HEIGHT_PX,
            client_height: DEFAULT_CLIENT_HEIGHT_PX,
            scroll_top: 0.0,
            indicator: false,
        }
    }

    /// Override the viewport geometry (visible height and per-line height, in px)
    #[must_use]
    pub fn with_viewport(mut self, client_height: f64, line_height: f64) -> Self {
        self.client_height = client_height.max(0.0);
        self.line_height = line_height.max(1.0);
        self
    }

    /// Add one entry
    pub fn push(&mut self, entry: T) -> bool {
        self.extend(std::iter::once(entry))
    }

    /// Add a batch of entries as one update; returns whether anything was added
    pub fn extend<I>(&mut self, entries: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let was_at_bottom = self.is_at_bottom();
        let mut added = false;

        for entry in entries {
            added = true;
            match self.placement {
                Placement::NewestLast => {
                    self.entries.push_back(entry);
                    while self.entries.len() > self.capacity {
                        self.entries.pop_front();
                    }
                }
                Placement::NewestFirst => {
                    self.entries.push_front(entry);
                    self.entries.truncate(self.capacity);
                }
            }
        }

        if !added {
            return false;
        }

        if was_at_bottom {
            self.scroll_to_bottom();
        } else {
            self.scroll_top = self.scroll_top.min(self.max_scroll());
            self.indicator = true;
        }
        true
    }

    /// Drop every entry and reset the scroll position
    pub fn clear(&mut self) {
        self.entries.clear();
        self.scroll_top = 0.0;
        self.indicator = false;
    }

    /// Viewer scrolled to `offset`; reaching the bottom hides the indicator
    pub fn scroll_to(&mut self, offset: f64) {
        self.scroll_top = offset.clamp(0.0, self.max_scroll());
        if self.is_at_bottom() {
            self.indicator = false;
        }
    }

    /// Jump to the newest content and hide the indicator
    pub fn scroll_to_bottom(&mut self) {
        self.scroll_top = self.max_scroll();
        self.indicator = false;
    }

    pub fn is_at_bottom(&self) -> bool {
        self.scroll_top >= self.max_scroll() - BOTTOM_TOLERANCE_PX
    }

    /// Whether the "new entries" affordance is showing
    pub fn has_new_entries_indicator(&self) -> bool {
        self.indicator
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn scroll_height(&self) -> f64 {
        self.entries.len() as f64 * self.line_height
    }

    fn max_scroll(&self) -> f64 {
        (self.scroll_height() - self.client_height).max(0.0)
    }

    /// Entries in display order, top to bottom
    pub fn entries(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Activity line severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn css_class(self) -> &'static str {
        match self {
            Severity::Info => "log-info",
            Severity::Success => "log-success",
            Severity::Warning => "log-warning",
            Severity::Error => "log-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub severity: Severity,
}

impl ActivityEntry {
    /// `[dd/mm/yyyy HH:MM:SS] message`
    pub fn render(&self) -> String {
        format!(
            "[{}] {}",
            self.timestamp.format("%d/%m/%Y %H:%M:%S"),
            self.message
        )
    }
}

/// Shared activity log, newest entry on top
#[derive(Debug, Clone)]
pub struct ActivityLog {
    panel: Arc<Mutex<LogPanel<ActivityEntry>>>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            panel: Arc::new(Mutex::new(LogPanel::new(capacity, Placement::NewestFirst))),
        }
    }

    pub fn add(&self, message: impl Into<String>, severity: Severity) {
        let entry = ActivityEntry {
            timestamp: Local::now(),
            message: message.into(),
            severity,
        };
        tracing::debug!(severity = ?entry.severity, message = %entry.message, "activity");
        self.with_panel(|panel| {
            panel.push(entry);
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.add(message, Severity::Info);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.add(message, Severity::Success);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.add(message, Severity::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.add(message, Severity::Error);
    }

    /// Empty the log, then record that it was cleared
    pub fn clear(&self) {
        self.with_panel(LogPanel::clear);
        self.info("Activity log cleared");
    }

    /// Entries newest first
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.with_panel(|panel| panel.entries().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.with_panel(|panel| panel.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Viewer scroll hooks
    pub fn scroll_to(&self, offset: f64) {
        self.with_panel(|panel| panel.scroll_to(offset));
    }

    pub fn scroll_to_bottom(&self) {
        self.with_panel(LogPanel::scroll_to_bottom);
    }

    pub fn has_new_entries_indicator(&self) -> bool {
        self.with_panel(|panel| panel.has_new_entries_indicator())
    }

    fn with_panel<R>(&self, f: impl FnOnce(&mut LogPanel<ActivityEntry>) -> R) -> R {
        let mut panel = self.panel.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut panel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_last_evicts_oldest() {
        let mut panel = LogPanel::new(3, Placement::NewestLast);
        panel.extend(1..=5);
        assert_eq!(panel.entries().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(panel.len(), panel.capacity());
    }

    #[test]
    fn test_newest_first_evicts_oldest() {
        let mut panel = LogPanel::new(3, Placement::NewestFirst);
        for i in 1..=5 {
            panel.push(i);
        }
        assert_eq!(panel.entries().copied().collect::<Vec<_>>(), vec![5, 4, 3]);
    }

    #[test]
    fn test_follows_bottom_when_parked_there() {
        // 5 lines of 20px fit in 100px
        let mut panel = LogPanel::new(50, Placement::NewestLast).with_viewport(100.0, 20.0);
        panel.extend(0..10);
        assert!(panel.is_at_bottom());
        assert!((panel.scroll_top() - 100.0).abs() < f64::EPSILON);
        assert!(!panel.has_new_entries_indicator());

        panel.push(10);
        assert!((panel.scroll_top() - 120.0).abs() < f64::EPSILON);
        assert!(!panel.has_new_entries_indicator());
    }

    #[test]
    fn test_indicator_when_scrolled_away() {
        let mut panel = LogPanel::new(50, Placement::NewestLast).with_viewport(100.0, 20.0);
        panel.extend(0..10);
        panel.scroll_to(0.0);
        assert!(!panel.is_at_bottom());

        panel.push(10);
        assert!((panel.scroll_top()).abs() < f64::EPSILON);
        assert!(panel.has_new_entries_indicator());

        // Within tolerance of the bottom counts as the bottom
        panel.scroll_to(panel.scroll_height() - 100.0 - 3.0);
        assert!(!panel.has_new_entries_indicator());
    }

    #[test]
    fn test_indicator_cleared_by_jump() {
        let mut panel = LogPanel::new(50, Placement::NewestLast).with_viewport(100.0, 20.0);
        panel.extend(0..10);
        panel.scroll_to(10.0);
        panel.push(10);
        assert!(panel.has_new_entries_indicator());
        panel.scroll_to_bottom();
        assert!(!panel.has_new_entries_indicator());
        assert!(panel.is_at_bottom());
    }

    #[test]
    fn test_empty_batch_changes_nothing() {
        let mut panel: LogPanel<u8> = LogPanel::new(5, Placement::NewestLast);
        assert!(!panel.extend(std::iter::empty()));
        assert!(panel.is_empty());
        assert!(!panel.has_new_entries_indicator());
    }

    #[test]
    fn test_activity_log_cap_and_order() {
        let log = ActivityLog::new(50);
        for i in 0..60 {
            log.info(format!("line {i}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].message, "line 59");
        assert_eq!(entries[49].message, "line 10");
    }

    #[test]
    fn test_activity_log_clear() {
        let log = ActivityLog::new(50);
        log.error("boom");
        log.success("ok");
        log.clear();
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "Activity log cleared");
        assert_eq!(entries[0].severity, Severity::Info);
        assert!(entries[0].render().ends_with("] Activity log cleared"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_exceeds_capacity_and_keeps_newest(
                capacity in 1usize..16,
                batches in prop::collection::vec(prop::collection::vec(any::<u16>(), 0..10), 0..20),
                newest_first in any::<bool>(),
            ) {
                let placement = if newest_first {
                    Placement::NewestFirst
                } else {
                    Placement::NewestLast
                };
                let mut panel = LogPanel::new(capacity, placement);
                let mut pushed = Vec::new();
                for batch in batches {
                    pushed.extend(batch.iter().copied());
                    panel.extend(batch);
                    prop_assert!(panel.len() <= capacity);
                }

                let kept: Vec<u16> = pushed.iter().rev().take(capacity).copied().collect();
                let mut shown: Vec<u16> = panel.entries().copied().collect();
                if !newest_first {
                    shown.reverse();
                }
                prop_assert_eq!(shown, kept);
            }
        }
    }
}
