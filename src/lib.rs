//! PFCAM real-time client.
//!
//! Client-side real-time layer of the PFCAM camera manager: a push channel
//! that receives server notifications, a bounded store that holds them for
//! display, and a watchdog that ends the session after too long or too
//! idle.
//!
//! # Architecture
//!
//! - **Connection** - WebSocket push channel with bounded linear backoff
//! - **Notifications** - Domain types and the bounded, age-limited store
//! - **Session** - Lifetime and inactivity enforcement
//! - **Realtime** - Facade wiring the three together
//!
//! Every time-dependent decision reads an injected [`Clock`]; every
//! persisted value goes through [`SessionStorage`]; the bearer token comes
//! from a [`CredentialStore`].
//!
//! # Modules
//!
//! - [`connection`] - Push channel lifecycle and frame decoding
//! - [`notifications`] - Notification types and store
//! - [`session`] - Session watchdog
//! - [`realtime`] - Application facade
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod auth;
pub mod connection;
pub mod notifications;
pub mod realtime;
pub mod session;
pub mod ws;

pub mod clock;
pub mod config;
pub mod constants;
pub mod env;
pub mod listeners;
pub mod storage;

// Re-export commonly used types
pub use auth::{Claims, CredentialStore, Identity, StaticCredentials};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState, RetryPolicy};
pub use env::Environment;
pub use listeners::ListenerId;
pub use notifications::{
    NotificationEvent, NotificationKind, NotificationPreferences, NotificationStore, Priority,
    StoreChange, StoredNotification,
};
pub use session::{ActivitySignal, ExpiryReason, SessionExpired, SessionGuard};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};

// Re-export the facade
pub use realtime::RealtimeClient;
