//! Application-wide constants for pfcam-realtime.
//!
//! Centralizes the limits and intervals of the push channel, the
//! notification store and the session watchdog. Each value is the default
//! for the matching [`crate::config::Config`] field.

use std::time::Duration;

// ============================================================================
// Push channel
// ============================================================================

/// Time allowed for the WebSocket handshake before an attempt counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay between reconnect attempts.
///
/// Attempt `n` (1-indexed) waits `n × RECONNECT_BASE_DELAY`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Reconnect attempts allowed after an abnormal closure before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Path prefix of the notification WebSocket endpoint.
pub const NOTIFICATION_WS_PATH: &str = "/notifications/ws";

/// Control frame the server sends right after accepting the channel.
pub const CONNECTION_ESTABLISHED: &str = "connection_established";

/// Close code the server uses when it rejects the bearer token.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

// ============================================================================
// Notification store
// ============================================================================

/// Maximum number of notifications held in memory.
pub const MAX_NOTIFICATIONS: usize = 50;

/// Notifications older than this are evicted.
pub const NOTIFICATION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval of the background age sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shortest period accepted for the sweeper and the watchdog.
pub const MIN_TIMER_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Session watchdog
// ============================================================================

/// Absolute session lifetime measured from login.
pub const SESSION_MAX_DURATION: Duration = Duration::from_secs(8 * 60 * 60);

/// Maximum time without qualifying input before a forced logout.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Interval between watchdog ticks.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum spacing between persisted activity writes.
///
/// Pointer-move events arrive at frame rate; persisting each one would turn
/// a cheap handler into storage I/O. One second is far below the inactivity
/// threshold's resolution.
pub const ACTIVITY_WRITE_GRANULARITY: Duration = Duration::from_secs(1);

/// Storage key holding the login instant (epoch milliseconds).
pub const SESSION_START_KEY: &str = "session_start";

/// Storage key holding the last qualifying input instant (epoch milliseconds).
pub const LAST_ACTIVITY_KEY: &str = "last_activity";
