//! Status line boundary towards the UI.

use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColor {
    Normal,
    Red,
}

/// Single-line, coloured status display. Write-only.
pub trait StatusSink: Send + Sync {
    fn set_status_line(&self, text: &str, color: StatusColor);
}

/// Routes status lines into the log. Used when no UI is attached.
#[derive(Debug, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn set_status_line(&self, text: &str, color: StatusColor) {
        match color {
            StatusColor::Normal => info!("Status: {}", text),
            StatusColor::Red => warn!("Status: {}", text),
        }
    }
}

/// Keeps every line it receives.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    lines: Mutex<Vec<(String, StatusColor)>>,
}

impl RecordingStatusSink {
    fn lock(&self) -> MutexGuard<'_, Vec<(String, StatusColor)>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lines(&self) -> Vec<(String, StatusColor)> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<(String, StatusColor)> {
        self.lock().last().cloned()
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.lock()
            .iter()
            .filter(|(text, _)| text.starts_with(prefix))
            .count()
    }
}

impl StatusSink for RecordingStatusSink {
    fn set_status_line(&self, text: &str, color: StatusColor) {
        self.lock().push((text.to_string(), color));
    }
}
