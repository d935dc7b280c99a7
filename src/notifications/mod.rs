//! Notification domain types.
//!
//! A [`NotificationEvent`] is what the PFCAM backend pushes over the
//! notification channel, decoded into typed fields. The
//! [`store`] submodule materializes the stream for presentation.
//!
//! # Kinds
//!
//! | Wire `type`          | Preference gate               |
//! |----------------------|-------------------------------|
//! | `event_captured`     | `event_notifications`         |
//! | `camera_offline`     | `camera_status_notifications` |
//! | `camera_online`      | `camera_status_notifications` |
//! | `storage_full`       | `system_alerts`               |
//! | `system_alert`       | `system_alerts`               |
//! | `user_activity`      | always delivered              |
//! | anything else        | always delivered              |
//!
//! `session_expired` and `inactivity_logout` are produced locally by the
//! session watchdog.

pub mod store;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{NotificationStore, StoreChange, StoreLimits, StoredNotification};

/// Kind of notification, from the wire `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    /// A camera captured a new event.
    EventCaptured,
    /// A camera stopped responding.
    CameraOffline,
    /// A camera came back online.
    CameraOnline,
    /// Recording storage is full.
    StorageFull,
    /// Operator-facing system alert.
    SystemAlert,
    /// Another user's activity.
    UserActivity,
    /// The absolute session lifetime elapsed (local).
    SessionExpired,
    /// The user was logged out for inactivity (local).
    InactivityLogout,
    /// Any kind this client does not know.
    Other(String),
}

impl NotificationKind {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::EventCaptured => "event_captured",
            Self::CameraOffline => "camera_offline",
            Self::CameraOnline => "camera_online",
            Self::StorageFull => "storage_full",
            Self::SystemAlert => "system_alert",
            Self::UserActivity => "user_activity",
            Self::SessionExpired => "session_expired",
            Self::InactivityLogout => "inactivity_logout",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "event_captured" => Self::EventCaptured,
            "camera_offline" => Self::CameraOffline,
            "camera_online" => Self::CameraOnline,
            "storage_full" => Self::StorageFull,
            "system_alert" => Self::SystemAlert,
            "user_activity" => Self::UserActivity,
            "session_expired" => Self::SessionExpired,
            "inactivity_logout" => Self::InactivityLogout,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for NotificationKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Unknown values decode as [`Priority::Normal`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Priority {
    /// Informational.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Needs attention.
    High,
    /// Needs immediate attention.
    Urgent,
}

impl From<String> for Priority {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// A server-originated notification. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    /// Notification kind (wire `type`).
    pub kind: NotificationKind,
    /// Short headline.
    pub title: String,
    /// Body text (wire `message`).
    pub body: String,
    /// Opaque structured payload (wire `data`).
    pub payload: serde_json::Value,
    /// When the server says the event happened (wire `timestamp`).
    pub occurred_at: DateTime<Utc>,
    /// Delivery priority.
    pub priority: Priority,
    /// Free-form grouping, `"general"` when absent.
    pub category: String,
}

/// Default category for notifications that carry none.
pub const DEFAULT_CATEGORY: &str = "general";

impl NotificationEvent {
    /// Event with an empty payload, normal priority and default category.
    #[must_use]
    pub fn new(
        kind: impl Into<NotificationKind>,
        title: impl Into<String>,
        body: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            occurred_at,
            priority: Priority::Normal,
            category: DEFAULT_CATEGORY.to_string(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Parse a wire timestamp.
///
/// Accepted forms, in order: RFC 3339 with offset, naive ISO-8601
/// (`2024-01-01T12:30:00.123456`), `YYYY-MM-DD HH:MM:SS` and
/// `YYYY-MM-DD HH:MM`. Naive forms are read as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    const NAIVE_FORMATS: [&str; 3] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Which notification families the user wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    /// Deliver captured-event notifications.
    pub event_notifications: bool,
    /// Deliver camera online/offline notifications.
    pub camera_status_notifications: bool,
    /// Deliver system alerts and storage warnings.
    pub system_alerts: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            event_notifications: true,
            camera_status_notifications: true,
            system_alerts: true,
        }
    }
}

impl NotificationPreferences {
    /// Whether a notification of `kind` should reach the store.
    #[must_use]
    pub fn allows(&self, kind: &NotificationKind) -> bool {
        match kind {
            NotificationKind::EventCaptured => self.event_notifications,
            NotificationKind::CameraOffline | NotificationKind::CameraOnline => {
                self.camera_status_notifications
            }
            NotificationKind::SystemAlert | NotificationKind::StorageFull => self.system_alerts,
            _ => true,
        }
    }
}
