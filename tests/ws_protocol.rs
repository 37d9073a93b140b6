//! Drives the real router over loopback WebSockets with an echoing PTY.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use shellmux::auth::TokenAuth;
use shellmux::error::Result;
use shellmux::pty::{PtyControl, PtyEvent, PtySpawner, SpawnedPty, TerminalSize};
use shellmux::session::SessionRegistry;
use shellmux::shutdown::Shutdown;
use shellmux::web::{AppState, router};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const TOKEN: &str = "integration-token";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Echoes every keystroke back as output; exits with 0 when terminated.
struct EchoSpawner;

struct EchoPty {
    events: mpsc::Sender<PtyEvent>,
}

#[async_trait]
impl PtyControl for EchoPty {
    fn write(&self, data: &[u8]) -> Result<()> {
        let _ = self
            .events
            .try_send(PtyEvent::Output(Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn resize(&self, _size: TerminalSize) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _grace: Duration) -> Result<()> {
        let _ = self.events.send(PtyEvent::Exit(0)).await;
        Ok(())
    }
}

impl PtySpawner for EchoSpawner {
    fn spawn(&self, _cwd: &Path, _size: TerminalSize) -> Result<SpawnedPty> {
        let (tx, rx) = mpsc::channel(64);
        Ok(SpawnedPty {
            control: Box::new(EchoPty { events: tx }),
            events: rx,
        })
    }
}

struct TestServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Shutdown,
    handle: JoinHandle<std::io::Result<()>>,
}

async fn start_server() -> TestServer {
    let registry = Arc::new(SessionRegistry::new(Arc::new(EchoSpawner), 64 * 1024));
    let shutdown = Shutdown::new();
    let app = router(AppState {
        registry: registry.clone(),
        auth: Arc::new(TokenAuth::with_cost(TOKEN, 4).unwrap()),
        default_cwd: std::env::temp_dir(),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        }
    });

    TestServer {
        addr,
        registry,
        shutdown,
        handle,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_frame(client: &mut Client) -> Message {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within timeout")
            .expect("socket closed")
            .unwrap();
        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
            return frame;
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    match next_frame(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a control frame, got {other:?}"),
    }
}

async fn next_output(client: &mut Client) -> Vec<u8> {
    match next_frame(client).await {
        Message::Binary(data) => data.to_vec(),
        other => panic!("expected an output frame, got {other:?}"),
    }
}

async fn authenticated(addr: SocketAddr) -> Client {
    let mut client = connect(addr).await;
    send_json(&mut client, json!({"type": "auth", "token": TOKEN})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "auth:success"}));
    client
}

#[tokio::test]
async fn control_requires_auth_first() {
    let server = start_server().await;
    let mut client = connect(server.addr).await;

    send_json(&mut client, json!({"type": "session:list"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Not authenticated"})
    );

    send_json(&mut client, json!({"type": "auth", "token": "wrong"})).await;
    assert_eq!(next_json(&mut client).await["type"], "auth:failed");

    send_json(&mut client, json!({"type": "auth", "token": TOKEN})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "auth:success"}));

    send_json(&mut client, json!({"type": "session:list"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "session:list", "sessions": []})
    );
}

#[tokio::test]
async fn sessions_are_shared_between_connections() {
    let server = start_server().await;
    let mut owner = authenticated(server.addr).await;

    send_json(&mut owner, json!({"type": "session:create", "cwd": "/"})).await;
    let created = next_json(&mut owner).await;
    assert_eq!(created["type"], "session:created");
    assert_eq!(created["session"]["cwd"], "/");
    let session_id = created["session"]["id"].as_str().unwrap().to_string();

    owner.send(Message::binary(b"hello".to_vec())).await.unwrap();
    assert_eq!(next_output(&mut owner).await, b"hello");

    let mut viewer = authenticated(server.addr).await;
    send_json(
        &mut viewer,
        json!({"type": "session:attach", "sessionId": session_id}),
    )
    .await;
    let attached = next_json(&mut viewer).await;
    assert_eq!(attached["type"], "session:attached");
    assert_eq!(attached["session"]["id"], session_id.as_str());
    assert_eq!(next_output(&mut viewer).await, b"hello");

    viewer.send(Message::binary(b"!".to_vec())).await.unwrap();
    assert_eq!(next_output(&mut owner).await, b"!");
    assert_eq!(next_output(&mut viewer).await, b"!");

    send_json(
        &mut viewer,
        json!({"type": "session:destroy", "sessionId": session_id}),
    )
    .await;

    let expected_exit = json!({"type": "session:exit", "sessionId": session_id, "exitCode": 0});
    assert_eq!(next_json(&mut owner).await, expected_exit);
    let mut viewer_frames = vec![next_json(&mut viewer).await, next_json(&mut viewer).await];
    viewer_frames.sort_by_key(|frame| frame["type"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        viewer_frames,
        vec![
            json!({"type": "session:destroyed", "sessionId": session_id}),
            expected_exit,
        ]
    );
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn attaching_to_an_unknown_session_reports_an_error() {
    let server = start_server().await;
    let mut client = authenticated(server.addr).await;

    send_json(
        &mut client,
        json!({"type": "session:attach", "sessionId": "missing"}),
    )
    .await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Session not found"})
    );

    send_json(&mut client, json!({"type": "session:teleport"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Unknown message type: session:teleport"})
    );
}

#[tokio::test]
async fn session_listing_over_http_requires_the_token() {
    let server = start_server().await;
    let mut client = authenticated(server.addr).await;
    send_json(&mut client, json!({"type": "session:create"})).await;
    let created = next_json(&mut client).await;

    let http = reqwest::Client::new();
    let url = format!("http://{}/api/sessions", server.addr);

    let response = http.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = http.get(&url).bearer_auth("nope").send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let sessions: Vec<Value> = http
        .get(&url)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], created["session"]["id"]);

    let response = http
        .get(format!("{url}?token={TOKEN}"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn shutdown_closes_open_sockets_and_stops_the_server() {
    let server = start_server().await;
    let mut client = authenticated(server.addr).await;
    send_json(&mut client, json!({"type": "session:create"})).await;
    next_json(&mut client).await;

    assert!(server.shutdown.trigger());

    match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("socket stayed open: {other:?}"),
    }
    tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    server.registry.destroy_all().await;
    assert!(server.registry.is_empty());
}
