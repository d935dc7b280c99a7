//! Application-facing real-time client.
//!
//! Wires the three components together:
//!
//! ```text
//! ConnectionManager ──notification──► preferences ──► NotificationStore
//!        ▲                                                   ▲
//!        └──── disconnect on expiry ──── SessionGuard ───────┘ (notice)
//! ```
//!
//! and owns the background tasks (age sweep, session watchdog). Subscribers
//! hold only weak references to the components, so dropping the client
//! tears everything down.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::task::JoinHandle;

use crate::auth::{CredentialStore, Identity};
use crate::clock::Clock;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionOptions, ConnectionState};
use crate::listeners::ListenerId;
use crate::notifications::{
    NotificationPreferences, NotificationStore, StoreChange, StoreLimits, StoredNotification,
};
use crate::session::{ActivitySignal, SessionExpired, SessionGuard, SessionLimits};
use crate::storage::SessionStorage;

/// Real-time notification client.
#[derive(Debug)]
pub struct RealtimeClient {
    connection: Arc<ConnectionManager>,
    store: Arc<NotificationStore>,
    session: Arc<SessionGuard>,
    credentials: Arc<dyn CredentialStore>,
    preferences: Arc<RwLock<NotificationPreferences>>,
    sweep_interval: std::time::Duration,
    watchdog_interval: std::time::Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Build the client from `config`.
    ///
    /// Nothing runs until [`RealtimeClient::start`].
    #[must_use]
    pub fn new(
        config: &Config,
        credentials: Arc<dyn CredentialStore>,
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(NotificationStore::new(
            StoreLimits::from(&config.store),
            Arc::clone(&clock),
        ));

        let connection = Arc::new(ConnectionManager::new(
            ConnectionOptions::from(&config.connection),
            Arc::clone(&credentials),
            Arc::clone(&clock),
        ));

        let mut session = SessionGuard::new(
            SessionLimits::from(&config.session),
            clock,
            storage,
            Arc::clone(&credentials),
        );
        if config.session.notify_on_expiry {
            session = session.with_notice_store(Arc::clone(&store));
        }
        let session = Arc::new(session);

        let preferences = Arc::new(RwLock::new(config.preferences));

        let sink = Arc::downgrade(&store);
        let gate = Arc::clone(&preferences);
        connection.add_notification_listener(move |event| {
            let allowed = gate
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .allows(&event.kind);
            if !allowed {
                log::debug!("[Realtime] Muted {} by preferences", event.kind);
                return;
            }
            if let Some(store) = sink.upgrade() {
                store.add(event.clone());
            }
        });

        let channel = Arc::downgrade(&connection);
        session.add_expiry_listener(move |_| {
            if let Some(connection) = channel.upgrade() {
                connection.disconnect();
            }
        });

        Self {
            connection,
            store,
            session,
            credentials,
            preferences,
            sweep_interval: config.store.sweep_interval(),
            watchdog_interval: config.session.watchdog_interval(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start background tasks and open the channel for `identity`.
    ///
    /// Must be called within a tokio runtime. Returns whether the channel
    /// was started (see [`ConnectionManager::connect`]).
    pub fn start(&self, identity: &Identity) -> bool {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if tasks.is_empty() {
                tasks.push(self.store.spawn_sweeper(self.sweep_interval));
                tasks.push(self.session.spawn_watchdog(self.watchdog_interval));
            }
        }
        self.connection.connect(identity)
    }

    /// Begin a fresh session and start (on login).
    ///
    /// The session is rolled back when the channel cannot be opened.
    pub fn login(&self, identity: &Identity) -> bool {
        self.session.begin_session();
        if self.start(identity) {
            return true;
        }
        self.session.end_session();
        self.stop();
        false
    }

    /// End the session, forget the token and close the channel.
    pub fn logout(&self) {
        self.session.end_session();
        self.credentials.clear();
        self.stop();
    }

    /// Close the channel and stop background tasks.
    pub fn stop(&self) {
        self.connection.disconnect();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    /// Replace notification preferences. Applies to frames received from
    /// now on.
    pub fn set_preferences(&self, preferences: NotificationPreferences) {
        *self
            .preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner) = preferences;
    }

    /// Current notification preferences.
    #[must_use]
    pub fn preferences(&self) -> NotificationPreferences {
        *self.preferences.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Note user input for the inactivity watchdog.
    pub fn record_activity(&self, signal: ActivitySignal) {
        self.session.record_activity(signal);
    }

    /// Notifications, newest first.
    #[must_use]
    pub fn list_notifications(&self) -> Vec<StoredNotification> {
        self.store.list()
    }

    /// Number of unread notifications.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.store.unread_count()
    }

    /// Mark one notification read.
    pub fn mark_read(&self, id: &str) -> bool {
        self.store.mark_read(id)
    }

    /// Mark every notification read.
    pub fn mark_all_read(&self) -> usize {
        self.store.mark_all_read()
    }

    /// Remove one notification.
    pub fn remove_notification(&self, id: &str) -> bool {
        self.store.remove(id)
    }

    /// Remove every notification.
    pub fn clear_notifications(&self) {
        self.store.clear();
    }

    /// Whether the push channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Push channel state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribe to connected/disconnected changes.
    pub fn on_connection_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.connection.add_connection_listener(listener)
    }

    /// Subscribe to store changes.
    pub fn on_store_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Subscribe to session expiry.
    pub fn on_session_expired<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionExpired) + Send + Sync + 'static,
    {
        self.session.add_expiry_listener(listener)
    }

    /// The push channel.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The notification store.
    #[must_use]
    pub fn store(&self) -> &Arc<NotificationStore> {
        &self.store
    }

    /// The session guard.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
