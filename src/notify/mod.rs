//! Operator notification seam
//!
//! Human-visible alerts go through a [`Notifier`]; the actual desktop
//! notification transport lives outside this process. The default
//! implementation logs. Like event emission, notification is
//! best-effort and never propagates failures.

use tracing::{info, warn};

/// Notification urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Critical => "critical",
        }
    }
}

/// Notification icon, mapped to freedesktop.org icon names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icon {
    Info,
    Warning,
    Error,
}

impl Icon {
    /// The freedesktop.org icon name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "dialog-information",
            Self::Warning => "dialog-warning",
            Self::Error => "dialog-error",
        }
    }
}

/// Sink for human-visible alerts.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &str, body: &str, urgency: Urgency, icon: Icon, timeout_ms: u64);
}

/// Default notifier: alerts land in the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &str, body: &str, urgency: Urgency, icon: Icon, _timeout_ms: u64) {
        match urgency {
            Urgency::Normal => {
                info!(summary = summary, body = body, icon = icon.name(), "Notification")
            }
            Urgency::Critical => {
                warn!(summary = summary, body = body, icon = icon.name(), "Notification")
            }
        }
    }
}

/// Notifier that drops everything.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _: &str, _: &str, _: Urgency, _: Icon, _: u64) {}
}
