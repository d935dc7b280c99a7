//! Session lifetime and inactivity watchdog.
//!
//! Two limits force a logout:
//!
//! - Absolute lifetime: time since `session_start` (default 8 h).
//! - Inactivity: time since the last qualifying input (default 30 min).
//!
//! Both instants are persisted as epoch-millisecond strings through
//! [`SessionStorage`] so a restart does not reset them. Time is read from
//! the injected [`Clock`].
//!
//! Expiry clears the stored credentials and timestamps, raises one notice in
//! the notification store (when attached) and tells expiry listeners. A
//! second expiry for the same session is a no-op: the absence of
//! `session_start` marks the session as already ended.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::auth::CredentialStore;
use crate::clock::{elapsed_since, Clock};
use crate::config::SessionConfig;
use crate::constants::{
    ACTIVITY_WRITE_GRANULARITY, LAST_ACTIVITY_KEY, MIN_TIMER_INTERVAL, SESSION_START_KEY,
};
use crate::listeners::{ListenerId, ListenerSet};
use crate::notifications::{NotificationEvent, NotificationKind, NotificationStore, Priority};
use crate::storage::SessionStorage;

/// Input that counts as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    /// Pointer moved.
    PointerMove,
    /// Key pressed.
    KeyPress,
    /// Pointer button pressed.
    PointerPress,
    /// Touch started.
    TouchStart,
}

impl std::fmt::Display for ActivitySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PointerMove => write!(f, "pointer_move"),
            Self::KeyPress => write!(f, "key_press"),
            Self::PointerPress => write!(f, "pointer_press"),
            Self::TouchStart => write!(f, "touch_start"),
        }
    }
}

/// Which limit ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryReason {
    /// Absolute lifetime exceeded.
    SessionLifetime,
    /// No qualifying input for too long.
    Inactivity,
}

impl std::fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionLifetime => write!(f, "session lifetime exceeded"),
            Self::Inactivity => write!(f, "inactivity timeout"),
        }
    }
}

/// Emitted to expiry listeners once per ended session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpired {
    /// Which limit was hit.
    pub reason: ExpiryReason,
    /// When the watchdog noticed.
    pub at: DateTime<Utc>,
    /// User-facing explanation.
    pub message: String,
}

/// Thresholds of a [`SessionGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Absolute lifetime.
    pub max_session: Duration,
    /// Inactivity timeout.
    pub inactivity: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_session: config.max_session(),
            inactivity: config.inactivity_timeout(),
        }
    }
}

impl SessionLimits {
    fn notice(&self, reason: ExpiryReason, at: DateTime<Utc>) -> NotificationEvent {
        let (kind, title, body) = match reason {
            ExpiryReason::SessionLifetime => (
                NotificationKind::SessionExpired,
                "Session Expired",
                "Your session has expired. Please log in again.".to_string(),
            ),
            ExpiryReason::Inactivity => (
                NotificationKind::InactivityLogout,
                "Logged Out",
                format!(
                    "You were logged out after {} minutes of inactivity.",
                    self.inactivity.as_secs() / 60
                ),
            ),
        };
        NotificationEvent::new(kind, title, body, at)
            .with_priority(Priority::High)
            .with_category("session")
            .with_payload(serde_json::json!({ "reason": reason.to_string() }))
    }
}

fn to_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

fn from_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

/// Session lifetime and inactivity enforcement.
#[derive(Debug)]
pub struct SessionGuard {
    limits: SessionLimits,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn SessionStorage>,
    credentials: Arc<dyn CredentialStore>,
    notices: Option<Arc<NotificationStore>>,
    listeners: ListenerSet<SessionExpired>,
    /// Epoch millis of the last persisted activity write.
    last_written_ms: AtomicI64,
    /// Serializes expiry so concurrent ticks produce one notice.
    expiry: Mutex<()>,
}

impl SessionGuard {
    /// Create a guard over `storage` and `credentials`.
    #[must_use]
    pub fn new(
        limits: SessionLimits,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn SessionStorage>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            limits,
            clock,
            storage,
            credentials,
            notices: None,
            listeners: ListenerSet::new("Session"),
            last_written_ms: AtomicI64::new(i64::MIN),
            expiry: Mutex::new(()),
        }
    }

    /// Raise expiry notices into `store`.
    #[must_use]
    pub fn with_notice_store(mut self, store: Arc<NotificationStore>) -> Self {
        self.notices = Some(store);
        self
    }

    /// Thresholds in force.
    #[must_use]
    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Start a session now (on login). Resets both instants.
    pub fn begin_session(&self) {
        let now = to_millis(self.clock.now());
        self.storage.set(SESSION_START_KEY, now.to_string());
        self.storage.set(LAST_ACTIVITY_KEY, now.to_string());
        self.last_written_ms.store(now, Ordering::Relaxed);
        log::info!("[Session] Started");
    }

    /// End the session without a notice (explicit logout).
    pub fn end_session(&self) {
        self.storage.remove(SESSION_START_KEY);
        self.storage.remove(LAST_ACTIVITY_KEY);
        log::info!("[Session] Ended");
    }

    /// Whether a session is in progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session_start().is_some()
    }

    /// Login instant, if a session is in progress.
    ///
    /// An unparseable stored value reads as no session.
    #[must_use]
    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.storage
            .get(SESSION_START_KEY)
            .as_deref()
            .and_then(from_millis)
    }

    /// Last qualifying input instant.
    #[must_use]
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.storage
            .get(LAST_ACTIVITY_KEY)
            .as_deref()
            .and_then(from_millis)
    }

    /// Note user input.
    ///
    /// Cheap enough for every pointer move: writes reach storage at most
    /// once per second. Ignored when no session is in progress.
    pub fn record_activity(&self, signal: ActivitySignal) {
        let now = to_millis(self.clock.now());
        let last = self.last_written_ms.load(Ordering::Relaxed);
        let granularity = ACTIVITY_WRITE_GRANULARITY.as_millis() as i64;
        if (last..last.saturating_add(granularity)).contains(&now) {
            return;
        }
        if !self.is_active() {
            return;
        }
        if self
            .last_written_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.storage.set(LAST_ACTIVITY_KEY, now.to_string());
            log::trace!("[Session] Activity ({})", signal);
        }
    }

    /// Evaluate both limits once.
    ///
    /// Lifetime is checked before inactivity. A stored login instant that
    /// cannot be read ends the session as if its lifetime had passed.
    /// Returns the reason if this call ended the session.
    pub fn tick(&self) -> Option<ExpiryReason> {
        let raw = self.storage.get(SESSION_START_KEY)?;
        let Some(start) = from_millis(&raw) else {
            log::warn!("[Session] Unreadable session_start {:?}, ending session", raw);
            let reason = ExpiryReason::SessionLifetime;
            return self.expire(reason).then_some(reason);
        };
        let now = self.clock.now();
        let last = self.last_activity().unwrap_or(start);

        let reason = if elapsed_since(now, start) >= self.limits.max_session {
            ExpiryReason::SessionLifetime
        } else if elapsed_since(now, last) >= self.limits.inactivity {
            ExpiryReason::Inactivity
        } else {
            return None;
        };

        self.expire(reason).then_some(reason)
    }

    /// End the session for `reason`.
    ///
    /// Returns `false` if no session was in progress, in which case nothing
    /// is cleared and no notice is raised.
    pub fn expire(&self, reason: ExpiryReason) -> bool {
        let (expired, notice) = {
            let _serial = self.expiry.lock().unwrap_or_else(PoisonError::into_inner);
            if self.storage.get(SESSION_START_KEY).is_none() {
                return false;
            }
            self.storage.remove(SESSION_START_KEY);
            self.storage.remove(LAST_ACTIVITY_KEY);
            self.credentials.clear();

            let at = self.clock.now();
            let notice = self.limits.notice(reason, at);
            let expired = SessionExpired {
                reason,
                at,
                message: notice.body.clone(),
            };
            (expired, notice)
        };

        log::warn!("[Session] Expired: {}", reason);
        if let Some(store) = &self.notices {
            store.add(notice);
        }
        self.listeners.emit(&expired);
        true
    }

    /// Subscribe to session expiry.
    pub fn add_expiry_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionExpired) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    /// Remove an expiry listener.
    pub fn remove_expiry_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Spawn the watchdog on the current tokio runtime.
    ///
    /// The first check runs immediately (covers a session that expired
    /// while the process was down), then every `interval`. The task holds a
    /// weak reference and exits once the guard is dropped.
    pub fn spawn_watchdog(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let guard = Arc::downgrade(self);
        tokio::spawn(watchdog_loop(guard, interval))
    }
}

async fn watchdog_loop(guard: Weak<SessionGuard>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(MIN_TIMER_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(guard) = guard.upgrade() else {
            log::debug!("[Session] Watchdog stopping, guard dropped");
            break;
        };
        if let Some(reason) = guard.tick() {
            log::info!("[Session] Watchdog ended session: {}", reason);
        }
    }
}
