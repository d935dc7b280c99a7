//! Push channel to the PFCAM notification endpoint.
//!
//! [`ConnectionManager`] owns at most one live WebSocket to
//! `{server}/notifications/ws/{user}?token=...`, decodes inbound frames
//! into [`NotificationEvent`]s and fans them out to subscribers.
//!
//! # Lifecycle
//!
//! ```text
//!              connect()                    handshake ok
//! Disconnected ─────────► Connecting ─────────────────────► Connected
//!      ▲                   │    ▲                               │
//!      │  retries spent    │    │ close code not 1000/4001      │
//!      └───────────────────┘    └───────────────────────────────┘
//!      ▲                                                        │
//!      └──────── disconnect() / close code 1000 or 4001 ────────┘
//! ```
//!
//! Retry `n` waits `n × base_delay`; after `max_attempts` failed retries the
//! channel stays `Disconnected` until the next explicit `connect()`. The
//! counter resets whenever the channel reaches `Connected`. Before every
//! retry the bearer token is re-read and checked; a missing or expired
//! token stops the loop. A close with code 4001 (token rejected by the
//! server) also ends the channel without retrying.
//!
//! # Staleness
//!
//! Each `connect()` / `disconnect()` bumps a generation counter. A channel
//! task only writes state while its generation is current, so a superseded
//! task can never flip the state back after a newer call.

pub mod frame;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::{check_token, CredentialStore, Identity, TokenRejection};
use crate::clock::Clock;
use crate::config::ConnectionConfig;
use crate::constants::{
    CLOSE_AUTH_FAILED, CONNECT_TIMEOUT, MAX_RECONNECT_ATTEMPTS, NOTIFICATION_WS_PATH,
    RECONNECT_BASE_DELAY,
};
use crate::listeners::{ListenerId, ListenerSet};
use crate::notifications::NotificationEvent;
use crate::ws::{self, WsMessage, WsReader, WsWriter, CLOSE_ABNORMAL, CLOSE_NORMAL};

pub use frame::{parse_frame, Frame, FrameError};

/// Push channel state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel and no retry pending.
    #[default]
    Disconnected,
    /// Handshake in progress or waiting to retry.
    Connecting,
    /// Channel open.
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Linear reconnect backoff with a retry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit; retry `n` waits `n × base_delay`.
    pub base_delay: Duration,
    /// Retries allowed before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: RECONNECT_BASE_DELAY,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-indexed), or `None` once the cap is
    /// exceeded.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt >= 1 && attempt <= self.max_attempts).then(|| self.base_delay * attempt)
    }
}

/// Settings of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Base URL of the backend (`http(s)://` or `ws(s)://`).
    pub server_url: String,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// Reconnect policy.
    pub retry: RetryPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            connect_timeout: config.connect_timeout(),
            retry: RetryPolicy {
                base_delay: config.reconnect_base_delay(),
                max_attempts: config.max_reconnect_attempts,
            },
        }
    }
}

impl ConnectionOptions {
    /// Options pointing at `server_url` with default timing.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connect_timeout: CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Build the notification endpoint URL for `identity`.
///
/// The token travels as a percent-encoded query parameter because browsers
/// cannot set headers on a WebSocket upgrade and the server expects the same
/// form from every client.
#[must_use]
pub fn endpoint_url(server_url: &str, identity: &Identity, token: &str) -> String {
    format!(
        "{}{}/{}?token={}",
        ws::http_to_ws_scheme(server_url.trim_end_matches('/')),
        NOTIFICATION_WS_PATH,
        identity.endpoint_id(),
        urlencoding::encode(token)
    )
}

/// Why a live channel stopped.
#[derive(Debug)]
enum ChannelExit {
    /// `disconnect()` or a newer `connect()` cancelled the channel.
    Cancelled,
    /// The socket closed with `code`.
    Closed { code: u16, reason: String },
}

/// Which value, if any, connection listeners receive for a transition.
fn connection_signal(previous: ConnectionState, next: ConnectionState) -> Option<bool> {
    use ConnectionState::{Connected, Connecting, Disconnected};
    match (previous, next) {
        (a, b) if a == b => None,
        (_, Connected) => Some(true),
        (Connected, _) | (Connecting, Disconnected) => Some(false),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: ConnectionState,
    generation: u64,
    cancel: Option<CancellationToken>,
    identity: Option<Identity>,
    attempt: u32,
}

#[derive(Debug)]
struct Shared {
    options: ConnectionOptions,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    slot: Mutex<Slot>,
    connection_listeners: ListenerSet<bool>,
    notification_listeners: ListenerSet<NotificationEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if `generation` is still current.
    ///
    /// Returns `false` for a stale generation. Listeners run after the lock
    /// is released.
    fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let signal = {
            let mut slot = self.lock();
            if slot.generation != generation {
                return false;
            }
            let previous = std::mem::replace(&mut slot.state, next);
            if next == ConnectionState::Connected {
                slot.attempt = 0;
            }
            connection_signal(previous, next)
        };

        if let Some(connected) = signal {
            self.connection_listeners.emit(&connected);
        }
        true
    }

    fn record_attempt(&self, generation: u64, attempt: u32) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.attempt = attempt;
        }
    }

    fn usable_token(&self) -> Result<String, TokenRejection> {
        let token = self.credentials.token();
        check_token(token.as_deref(), self.clock.now())?;
        token.ok_or(TokenRejection::Missing)
    }

    fn handle_text(&self, text: &str) {
        match parse_frame(text, self.clock.now()) {
            Ok(Frame::Established { user_id }) => {
                log::info!("[Push] Server acknowledged channel (user_id={:?})", user_id);
            }
            Ok(Frame::Notification(event)) => {
                log::debug!("[Push] Notification {}: {}", event.kind, event.title);
                self.notification_listeners.emit(&event);
            }
            Ok(Frame::Control { kind }) => {
                log::trace!("[Push] Ignoring control frame {:?}", kind);
            }
            Err(e) => {
                let preview: String = text.chars().take(100).collect();
                log::warn!("[Push] Dropping frame ({}): {}", e, preview);
            }
        }
    }
}

/// Owner of the notification push channel.
///
/// Must be used from within a tokio runtime; `connect()` spawns the channel
/// task on the current runtime. Dropping the manager cancels the channel.
#[derive(Debug)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    #[must_use]
    pub fn new(
        options: ConnectionOptions,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                credentials,
                clock,
                slot: Mutex::new(Slot::default()),
                connection_listeners: ListenerSet::new("Push"),
                notification_listeners: ListenerSet::new("Push"),
            }),
        }
    }

    /// Open the channel for `identity`.
    ///
    /// No-op (returns `false`) when no usable token is present or when
    /// called outside a tokio runtime. A channel that is already live or
    /// retrying is replaced.
    pub fn connect(&self, identity: &Identity) -> bool {
        if let Err(reason) = self.shared.usable_token() {
            log::warn!("[Push] Not connecting: {}", reason);
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("[Push] connect() called outside a tokio runtime");
            return false;
        };

        let (generation, cancel) = {
            let mut slot = self.shared.lock();
            if let Some(previous) = slot.cancel.take() {
                log::debug!("[Push] Replacing existing channel");
                previous.cancel();
            }
            slot.generation += 1;
            slot.attempt = 0;
            slot.identity = Some(identity.clone());
            let cancel = CancellationToken::new();
            slot.cancel = Some(cancel.clone());
            (slot.generation, cancel)
        };

        self.shared.transition(generation, ConnectionState::Connecting);
        runtime.spawn(run_channel(
            Arc::clone(&self.shared),
            identity.clone(),
            generation,
            cancel,
        ));
        true
    }

    /// Reconnect with the identity of the last `connect()` call.
    ///
    /// Used for a manual retry after the reconnect budget is spent.
    pub fn reconnect(&self) -> bool {
        let identity = self.shared.lock().identity.clone();
        match identity {
            Some(identity) => self.connect(&identity),
            None => {
                log::warn!("[Push] reconnect() before any connect()");
                false
            }
        }
    }

    /// Close the channel with code 1000 and stop retrying.
    ///
    /// Idempotent; listeners hear `false` only if a channel was live or
    /// pending.
    pub fn disconnect(&self) {
        let previous = {
            let mut slot = self.shared.lock();
            slot.generation += 1;
            slot.attempt = 0;
            if let Some(cancel) = slot.cancel.take() {
                cancel.cancel();
            }
            std::mem::replace(&mut slot.state, ConnectionState::Disconnected)
        };

        if previous != ConnectionState::Disconnected {
            log::info!("[Push] Disconnected by client");
            self.shared.connection_listeners.emit(&false);
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Retries made since the channel was last connected.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.lock().attempt
    }

    /// Options this manager was built with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    /// Subscribe to connected/disconnected changes.
    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.shared.connection_listeners.add(listener)
    }

    /// Remove a connection listener.
    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.shared.connection_listeners.remove(id)
    }

    /// Subscribe to decoded notifications.
    pub fn add_notification_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.shared.notification_listeners.add(listener)
    }

    /// Remove a notification listener.
    pub fn remove_notification_listener(&self, id: ListenerId) -> bool {
        self.shared.notification_listeners.remove(id)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

/// Connect, serve and retry until cancelled, closed normally or out of
/// retries.
async fn run_channel(
    shared: Arc<Shared>,
    identity: Identity,
    generation: u64,
    cancel: CancellationToken,
) {
    let retry = shared.options.retry;
    let mut attempt: u32 = 0;

    loop {
        let token = match shared.usable_token() {
            Ok(token) => token,
            Err(reason) => {
                log::warn!("[Push] Stopping reconnects: {}", reason);
                shared.transition(generation, ConnectionState::Disconnected);
                return;
            }
        };
        let url = endpoint_url(&shared.options.server_url, &identity, &token);
        log::info!("[Push] Connecting to {}", ws::redact_query(&url));

        let handshake = tokio::select! {
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(shared.options.connect_timeout, ws::connect(&url)) => result,
        };

        match handshake {
            Ok(Ok((mut writer, mut reader))) => {
                if !shared.transition(generation, ConnectionState::Connected) {
                    let _ = writer.close().await;
                    return;
                }
                attempt = 0;
                log::info!("[Push] Connected");

                match serve(&shared, &mut writer, &mut reader, &cancel).await {
                    ChannelExit::Cancelled => return,
                    ChannelExit::Closed { code, reason } if code == CLOSE_NORMAL => {
                        log::info!("[Push] Server closed channel normally: {}", reason);
                        shared.transition(generation, ConnectionState::Disconnected);
                        return;
                    }
                    ChannelExit::Closed { code, reason } if code == CLOSE_AUTH_FAILED => {
                        log::warn!("[Push] Server rejected credentials ({}): {}", code, reason);
                        shared.transition(generation, ConnectionState::Disconnected);
                        return;
                    }
                    ChannelExit::Closed { code, reason } => {
                        log::warn!("[Push] Channel closed abnormally ({}): {}", code, reason);
                    }
                }
            }
            Ok(Err(e)) => log::warn!("[Push] Connection failed: {:#}", e),
            Err(_) => log::warn!(
                "[Push] Handshake timed out after {:?}",
                shared.options.connect_timeout
            ),
        }

        attempt += 1;
        let Some(delay) = retry.delay_for(attempt) else {
            log::error!(
                "[Push] Giving up after {} reconnect attempts",
                retry.max_attempts
            );
            shared.transition(generation, ConnectionState::Disconnected);
            return;
        };

        if !shared.transition(generation, ConnectionState::Connecting) {
            return;
        }
        shared.record_attempt(generation, attempt);
        log::info!(
            "[Push] Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            retry.max_attempts
        );

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Read frames until the channel closes or is cancelled.
async fn serve(
    shared: &Shared,
    writer: &mut WsWriter,
    reader: &mut WsReader,
    cancel: &CancellationToken,
) -> ChannelExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = writer.send_close(CLOSE_NORMAL, "client disconnect").await {
                    log::debug!("[Push] Close frame not sent: {:#}", e);
                }
                let _ = writer.close().await;
                return ChannelExit::Cancelled;
            }
            message = reader.recv() => match message {
                Some(Ok(WsMessage::Text(text))) => shared.handle_text(&text),
                Some(Ok(WsMessage::Binary(data))) => {
                    shared.handle_text(&String::from_utf8_lossy(&data));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        log::debug!("[Push] Pong failed: {:#}", e);
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    return ChannelExit::Closed { code, reason };
                }
                Some(Err(e)) => {
                    return ChannelExit::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: format!("{e:#}"),
                    };
                }
                None => {
                    return ChannelExit::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "stream ended".to_string(),
                    };
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::clock::SystemClock;

    fn manager(token: Option<&str>) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionOptions::new("http://127.0.0.1:9"),
            Arc::new(StaticCredentials::new(token.map(str::to_string))),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_retry_policy_linear_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for(0), None);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(1000)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(3000)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_millis(5000)));
        assert_eq!(policy.delay_for(6), None);
    }

    #[test]
    fn test_endpoint_url() {
        let identity = Identity::new("admin@pfcam.local", Some(1));
        assert_eq!(
            endpoint_url("https://cam.example.com/", &identity, "a+b/c"),
            "wss://cam.example.com/notifications/ws/1?token=a%2Bb%2Fc"
        );

        let by_subject = Identity::new("admin@pfcam.local", None);
        assert_eq!(
            endpoint_url("http://localhost:8000", &by_subject, "t"),
            "ws://localhost:8000/notifications/ws/admin%40pfcam.local?token=t"
        );
    }

    #[test]
    fn test_connection_signal() {
        use ConnectionState::{Connected, Connecting, Disconnected};
        assert_eq!(connection_signal(Disconnected, Connecting), None);
        assert_eq!(connection_signal(Connecting, Connected), Some(true));
        assert_eq!(connection_signal(Connected, Connecting), Some(false));
        assert_eq!(connection_signal(Connected, Disconnected), Some(false));
        assert_eq!(connection_signal(Connecting, Disconnected), Some(false));
        assert_eq!(connection_signal(Connected, Connected), None);
    }

    #[test]
    fn test_connect_without_token_is_noop() {
        let manager = manager(None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        manager.add_connection_listener(move |c| sink.lock().unwrap().push(*c));

        assert!(!manager.connect(&Identity::new("u", Some(1))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connect_outside_runtime_is_noop() {
        let manager = manager(Some("token"));
        assert!(!manager.connect(&Identity::new("u", Some(1))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let manager = manager(Some("token"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        manager.add_connection_listener(move |c| sink.lock().unwrap().push(*c));

        manager.disconnect();
        manager.disconnect();
        assert!(calls.lock().unwrap().is_empty());
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_reconnect_without_identity() {
        assert!(!manager(Some("token")).reconnect());
    }

    #[test]
    fn test_handle_text_dispatch() {
        let manager = manager(Some("token"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = manager
            .add_notification_listener(move |e| sink.lock().unwrap().push(e.title.clone()));

        let shared = &manager.shared;
        shared.handle_text(r#"{"type":"connection_established","user_id":1}"#);
        shared.handle_text("not json");
        shared.handle_text(r#"{"type":"camera_online","title":"Cam 1","message":"Back"}"#);
        assert!(manager.remove_notification_listener(id));
        shared.handle_text(r#"{"type":"camera_online","title":"Cam 2","message":"Back"}"#);

        assert_eq!(*events.lock().unwrap(), vec!["Cam 1"]);
    }

    #[test]
    fn test_stale_generation_cannot_transition() {
        let manager = manager(Some("token"));
        let generation = manager.shared.lock().generation;
        manager.disconnect();
        assert!(!manager
            .shared
            .transition(generation, ConnectionState::Connected));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
