//! Inbound frame decoding for the notification channel.
//!
//! The server sends JSON objects. Two shapes matter:
//!
//! ```json
//! {"type": "connection_established", "user_id": 1, "timestamp": "..."}
//! {"type": "event_captured", "title": "...", "message": "...",
//!  "data": {...}, "timestamp": "...", "priority": "high", "category": "..."}
//! ```
//!
//! Anything else that is a JSON object is a control frame and is consumed
//! silently. Text that is not JSON is an error the caller logs and drops.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::constants::CONNECTION_ESTABLISHED;
use crate::notifications::{parse_timestamp, NotificationEvent, Priority, DEFAULT_CATEGORY};

/// Raw notification frame as sent by the server.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server acknowledged the channel.
    Established {
        /// User id echoed by the server.
        user_id: Option<i64>,
    },
    /// A notification for the user.
    Notification(NotificationEvent),
    /// Valid JSON that is not a notification.
    Control {
        /// The frame's `type`, if it had one.
        kind: Option<String>,
    },
}

/// Errors that can occur while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The text is not valid JSON.
    InvalidJson(String),
    /// The JSON is valid but not an object.
    NotAnObject,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "invalid JSON: {msg}"),
            Self::NotAnObject => write!(f, "frame is not a JSON object"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode one text frame.
///
/// `received_at` stands in for a missing or unparseable `timestamp`.
pub fn parse_frame(text: &str, received_at: DateTime<Utc>) -> Result<Frame, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject);
    }

    // Shape mismatches inside an object (e.g. a numeric title) are control
    // frames, not errors.
    let Ok(wire) = serde_json::from_value::<WireFrame>(value) else {
        return Ok(Frame::Control { kind: None });
    };

    if wire.kind.as_deref() == Some(CONNECTION_ESTABLISHED) {
        return Ok(Frame::Established {
            user_id: wire.user_id,
        });
    }

    let (Some(kind), Some(title), Some(body)) = (wire.kind.clone(), wire.title, wire.message)
    else {
        return Ok(Frame::Control { kind: wire.kind });
    };

    let occurred_at = wire
        .timestamp
        .as_deref()
        .and_then(|raw| {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                log::debug!("[Push] Unparseable timestamp {:?}, using receipt time", raw);
            }
            parsed
        })
        .unwrap_or(received_at);

    let payload = match wire.data {
        Some(data @ serde_json::Value::Object(_)) => data,
        Some(serde_json::Value::Null) | None => serde_json::Value::Object(serde_json::Map::new()),
        Some(other) => serde_json::json!({ "value": other }),
    };

    Ok(Frame::Notification(NotificationEvent {
        kind: kind.into(),
        title,
        body,
        payload,
        occurred_at,
        priority: wire.priority.unwrap_or_default(),
        category: wire
            .category
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
    }))
}
