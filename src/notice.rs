//! User-facing notices.
//!
//! Every component boundary converts its failures into a categorized notice
//! instead of letting errors cross into the detection loop. Notices are also
//! written to the log at a matching level.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeCategory {
    Camera,
    Detection,
    Trigger,
    Analysis,
    Recording,
    Artifact,
    Persistence,
    Settings,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub severity: Severity,
    pub category: NoticeCategory,
    pub message: String,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}/{:?}] {}", self.severity, self.category, self.message)
    }
}

/// Cloneable sender side of the notice channel.
///
/// A disabled notifier still logs; it just has nobody to deliver to.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<Notice>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => log::info!("notice: {:?}: {}", notice.category, notice.message),
            Severity::Warning => log::warn!("notice: {:?}: {}", notice.category, notice.message),
            Severity::Error => log::error!("notice: {:?}: {}", notice.category, notice.message),
        }
        if let Some(tx) = &self.tx {
            // Receiver gone means the UI is shutting down.
            let _ = tx.send(notice);
        }
    }

    pub fn info(&self, category: NoticeCategory, message: impl Into<String>) {
        self.publish(Notice {
            severity: Severity::Info,
            category,
            message: message.into(),
        });
    }

    pub fn warn(&self, category: NoticeCategory, message: impl Into<String>) {
        self.publish(Notice {
            severity: Severity::Warning,
            category,
            message: message.into(),
        });
    }

    pub fn error(&self, category: NoticeCategory, message: impl Into<String>) {
        self.publish(Notice {
            severity: Severity::Error,
            category,
            message: message.into(),
        });
    }
}
