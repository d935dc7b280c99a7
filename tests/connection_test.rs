//! Push channel tests against a real local WebSocket server.
//!
//! Each test binds `127.0.0.1:0`, serves scripted frames with
//! `tokio_tungstenite::accept_async`, and drives the client through the
//! public API only.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use pfcam_realtime::{
    Config, ConnectionManager, ConnectionOptions, ConnectionState, CredentialStore,
    Identity, ManualClock, MemoryStorage, NotificationKind, NotificationPreferences,
    RealtimeClient, RetryPolicy, StaticCredentials,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const EVENT_FRAME: &str =
    r#"{"type":"event_captured","title":"Motion","message":"Front door","data":{"camera_id":1},"timestamp":"2024-01-01T00:00:00"}"#;
const ESTABLISHED_FRAME: &str =
    r#"{"type":"connection_established","user_id":1,"timestamp":"2024-01-01T00:00:00"}"#;

/// Bind a local server; `handler` gets each accepted TCP stream with its
/// 0-based index. Returns the base URL and the accept counter.
async fn spawn_server<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(index, stream));
        }
    });

    (format!("http://{addr}"), accepted)
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
async fn wait_for(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).single().unwrap(),
    ))
}

fn fast_options(server_url: &str) -> ConnectionOptions {
    ConnectionOptions {
        server_url: server_url.to_string(),
        connect_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 5,
        },
    }
}

fn identity() -> Identity {
    Identity::new("admin@pfcam.local", Some(1))
}

fn record_connection_changes(manager: &ConnectionManager) -> Arc<Mutex<Vec<bool>>> {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    manager.add_connection_listener(move |connected| sink.lock().unwrap().push(*connected));
    changes
}

fn client_for(server_url: &str, prefs: NotificationPreferences) -> RealtimeClient {
    let mut config = Config::default();
    config.connection.server_url = server_url.to_string();
    config.preferences = prefs;

    RealtimeClient::new(
        &config,
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        Arc::new(MemoryStorage::new()),
        test_clock(),
    )
}

#[tokio::test]
async fn test_event_frame_stored_and_normal_close_on_disconnect() {
    let request_path = Arc::new(Mutex::new(None::<String>));
    let close_code = Arc::new(Mutex::new(None::<u16>));

    let path_slot = Arc::clone(&request_path);
    let code_slot = Arc::clone(&close_code);
    let (url, accepted) = spawn_server(move |_, stream| {
        let path_slot = Arc::clone(&path_slot);
        let code_slot = Arc::clone(&code_slot);
        async move {
            use tokio_tungstenite::tungstenite::handshake::server::{
                ErrorResponse, Request, Response,
            };
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *path_slot.lock().unwrap() = Some(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            ws.send(Message::Text(ESTABLISHED_FRAME.to_string())).await.unwrap();
            ws.send(Message::Text("{not json".to_string())).await.unwrap();
            ws.send(Message::Text(EVENT_FRAME.to_string())).await.unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if let Message::Close(frame) = message {
                    *code_slot.lock().unwrap() = frame.map(|f| u16::from(f.code));
                    break;
                }
            }
        }
    })
    .await;

    let client = client_for(&url, NotificationPreferences::default());
    assert!(client.start(&identity()));

    assert!(wait_for(Duration::from_secs(5), || client.unread_count() == 1).await);
    assert!(client.is_connected());

    let list = client.list_notifications();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].event.kind, NotificationKind::EventCaptured);
    assert_eq!(list[0].event.title, "Motion");
    assert!(!list[0].is_read);

    assert_eq!(
        request_path.lock().unwrap().as_deref(),
        Some("/notifications/ws/1?token=test-token")
    );

    client.stop();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(wait_for(Duration::from_secs(5), || close_code.lock().unwrap().is_some()).await);
    assert_eq!(*close_code.lock().unwrap(), Some(1000));
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exhausted_after_failed_handshakes() {
    // Accept the TCP connection and drop it before the upgrade completes.
    let (url, accepted) = spawn_server(|_, stream| async move { drop(stream) }).await;

    let manager = ConnectionManager::new(
        fast_options(&url),
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        test_clock(),
    );
    let changes = record_connection_changes(&manager);

    assert!(manager.connect(&identity()));
    assert!(
        wait_for(Duration::from_secs(5), || manager.state()
            == ConnectionState::Disconnected)
        .await
    );

    // Initial attempt plus five retries.
    assert_eq!(accepted.load(Ordering::SeqCst), 6);
    assert_eq!(*changes.lock().unwrap(), vec![false]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_normal_close_does_not_reconnect() {
    let (url, accepted) = spawn_server(|_, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(ESTABLISHED_FRAME.to_string())).await.unwrap();
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        let _ = ws.close(Some(frame)).await;
    })
    .await;

    let manager = ConnectionManager::new(
        fast_options(&url),
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        test_clock(),
    );
    let changes = record_connection_changes(&manager);

    manager.connect(&identity());
    assert!(wait_for(Duration::from_secs(5), || changes.lock().unwrap().len() == 2).await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(*changes.lock().unwrap(), vec![true, false]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_token_close_does_not_reconnect() {
    // The server upgrades first and only then rejects the token.
    let (url, accepted) = spawn_server(|_, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let frame = CloseFrame {
            code: CloseCode::from(4001),
            reason: "Invalid token".into(),
        };
        let _ = ws.close(Some(frame)).await;
    })
    .await;

    let manager = ConnectionManager::new(
        fast_options(&url),
        Arc::new(StaticCredentials::new(Some("revoked-token".to_string()))),
        test_clock(),
    );
    let changes = record_connection_changes(&manager);

    assert!(manager.connect(&identity()));
    assert!(wait_for(Duration::from_secs(5), || changes.lock().unwrap().len() == 2).await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(*changes.lock().unwrap(), vec![true, false]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_handshake_timeout_counts_as_failed_attempt() {
    // Accept TCP but never answer the upgrade request.
    let (url, accepted) = spawn_server(|_, stream| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    })
    .await;

    let mut options = fast_options(&url);
    options.connect_timeout = Duration::from_millis(200);
    options.retry.max_attempts = 2;
    let manager = ConnectionManager::new(
        options,
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        test_clock(),
    );
    let changes = record_connection_changes(&manager);

    manager.connect(&identity());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ConnectionState::Connecting);

    assert!(
        wait_for(Duration::from_secs(5), || manager.state()
            == ConnectionState::Disconnected)
        .await
    );
    // Initial attempt plus two retries, each cut off by the timeout.
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(*changes.lock().unwrap(), vec![false]);
}

#[tokio::test]
async fn test_abnormal_close_reconnects() {
    let (url, accepted) = spawn_server(|index, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if index == 0 {
            // Drop without a close frame: the client sees 1006.
            drop(ws);
            return;
        }
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let manager = ConnectionManager::new(
        fast_options(&url),
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        test_clock(),
    );
    let changes = record_connection_changes(&manager);

    manager.connect(&identity());
    assert!(wait_for(Duration::from_secs(5), || changes.lock().unwrap().len() == 3).await);

    assert_eq!(*changes.lock().unwrap(), vec![true, false, true]);
    assert!(manager.is_connected());
    assert_eq!(manager.reconnect_attempt(), 0);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    manager.disconnect();
}

#[tokio::test]
async fn test_missing_token_stops_retrying() {
    let (url, accepted) = spawn_server(|_, stream| async move { drop(stream) }).await;

    let credentials = Arc::new(StaticCredentials::new(Some("test-token".to_string())));
    let mut options = fast_options(&url);
    options.retry.base_delay = Duration::from_millis(500);
    let manager = ConnectionManager::new(
        options,
        Arc::clone(&credentials) as Arc<dyn CredentialStore>,
        test_clock(),
    );

    manager.connect(&identity());
    assert!(wait_for(Duration::from_secs(5), || accepted.load(Ordering::SeqCst) == 1).await);
    credentials.clear();

    assert!(
        wait_for(Duration::from_secs(5), || manager.state()
            == ConnectionState::Disconnected)
        .await
    );
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_replaces_live_channel() {
    let (url, accepted) = spawn_server(|_, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let manager = ConnectionManager::new(
        fast_options(&url),
        Arc::new(StaticCredentials::new(Some("test-token".to_string()))),
        test_clock(),
    );

    manager.connect(&identity());
    assert!(wait_for(Duration::from_secs(5), || manager.is_connected()).await);

    assert!(manager.reconnect());
    assert!(wait_for(Duration::from_secs(5), || accepted.load(Ordering::SeqCst) == 2).await);
    assert!(wait_for(Duration::from_secs(5), || manager.is_connected()).await);

    manager.disconnect();
    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_muted_kinds_never_reach_the_store() {
    let (url, _) = spawn_server(|_, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(EVENT_FRAME.to_string())).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"camera_offline","title":"Cam 2","message":"Offline","timestamp":"2024-01-01T00:01:00"}"#
                .to_string(),
        ))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let prefs = NotificationPreferences {
        event_notifications: false,
        ..NotificationPreferences::default()
    };
    let client = client_for(&url, prefs);
    client.start(&identity());

    assert!(wait_for(Duration::from_secs(5), || client.unread_count() == 1).await);
    let list = client.list_notifications();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].event.kind, NotificationKind::CameraOffline);

    client.stop();
}

#[tokio::test]
async fn test_binary_frame_decoded_as_text() {
    let (url, _) = spawn_server(|_, stream| async move {
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Binary(EVENT_FRAME.as_bytes().to_vec()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let client = client_for(&url, NotificationPreferences::default());
    client.start(&identity());

    assert!(wait_for(Duration::from_secs(5), || client.unread_count() == 1).await);
    client.stop();
}
