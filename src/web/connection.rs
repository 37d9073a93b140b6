//! Per-WebSocket connection state machine.
//!
//! ```text
//! Unauthenticated ──auth ok──► Authenticated { Detached ⇄ Attached(session) }
//! ```
//!
//! The connection never owns a session. It holds at most one [`Subscription`]
//! and looks sessions up by id in the shared registry on every request, so a
//! destroyed session simply stops answering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::protocol::{ControlRequest, Envelope, ProtocolError, ServerMessage};
use crate::auth::TokenValidator;
use crate::session::{Attachment, Session, SessionEvent, SessionRegistry, Subscription};

/// A frame the socket loop should send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON control envelope (text frame).
    Control(ServerMessage),
    /// Raw terminal output (binary frame).
    Output(Bytes),
}

impl From<ServerMessage> for Outbound {
    fn from(message: ServerMessage) -> Self {
        Outbound::Control(message)
    }
}

impl From<ProtocolError> for Outbound {
    fn from(err: ProtocolError) -> Self {
        Outbound::Control(err.into())
    }
}

pub struct Connection {
    registry: Arc<SessionRegistry>,
    auth: Arc<dyn TokenValidator>,
    default_cwd: PathBuf,
    authenticated: bool,
    attached: Option<Subscription>,
}

impl Connection {
    pub fn new(
        registry: Arc<SessionRegistry>,
        auth: Arc<dyn TokenValidator>,
        default_cwd: PathBuf,
    ) -> Self {
        Self {
            registry,
            auth,
            default_cwd,
            authenticated: false,
            attached: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn attached_session(&self) -> Option<&str> {
        self.attached.as_ref().map(Subscription::session_id)
    }

    /// Handle one control frame and return the replies, in send order.
    pub async fn handle_control(&mut self, payload: &[u8]) -> Vec<Outbound> {
        let envelope = match Envelope::parse(payload) {
            Ok(envelope) => envelope,
            Err(e) => return vec![e.into()],
        };
        if !self.authenticated && !envelope.is_auth() {
            debug!("Rejecting {} from unauthenticated connection", envelope.kind());
            return vec![ProtocolError::NotAuthenticated.into()];
        }
        match envelope.into_request() {
            Ok(request) => self.dispatch(request).await,
            Err(e) => vec![e.into()],
        }
    }

    async fn dispatch(&mut self, request: ControlRequest) -> Vec<Outbound> {
        match request {
            ControlRequest::Auth { token } => vec![self.authenticate(token).await],
            ControlRequest::CreateSession { cwd } => self.create_session(cwd.as_deref()).await,
            ControlRequest::ListSessions {} => vec![
                ServerMessage::SessionList {
                    sessions: self.registry.list(),
                }
                .into(),
            ],
            ControlRequest::AttachSession { session_id } => self.attach_session(&session_id),
            ControlRequest::Resize { cols, rows } => {
                if let (Some(cols), Some(rows)) = (cols, rows) {
                    self.resize(cols, rows);
                }
                Vec::new()
            }
            ControlRequest::DestroySession { session_id } => {
                self.registry.destroy(&session_id).await;
                vec![ServerMessage::SessionDestroyed { session_id }.into()]
            }
        }
    }

    async fn authenticate(&mut self, token: Option<String>) -> Outbound {
        let auth = self.auth.clone();
        let token = token.unwrap_or_default();
        // bcrypt verification blocks for tens of milliseconds.
        let valid = tokio::task::spawn_blocking(move || auth.validate(&token))
            .await
            .unwrap_or_else(|e| {
                warn!("Token validation task failed: {}", e);
                false
            });

        if valid {
            self.authenticated = true;
            info!("Connection authenticated");
            ServerMessage::AuthSuccess {}.into()
        } else {
            warn!("Connection presented an invalid token");
            ServerMessage::AuthFailed {
                error: "Invalid token".to_string(),
            }
            .into()
        }
    }

    async fn create_session(&mut self, cwd: Option<&str>) -> Vec<Outbound> {
        self.detach();
        let cwd = resolve_cwd(cwd, &self.default_cwd);
        let session = self.registry.create(cwd).await;
        let attachment = session.attach();
        let mut replies = vec![
            ServerMessage::SessionCreated {
                session: session.summary(),
            }
            .into(),
        ];
        self.follow(&session, attachment, &mut replies);
        replies
    }

    fn attach_session(&mut self, session_id: &str) -> Vec<Outbound> {
        let Some(session) = self.registry.get(session_id) else {
            return vec![ProtocolError::SessionNotFound.into()];
        };
        self.detach();
        let attachment = session.attach();
        let mut replies = vec![
            ServerMessage::SessionAttached {
                session: session.summary(),
            }
            .into(),
        ];
        self.follow(&session, attachment, &mut replies);
        replies
    }

    /// Queue the replay, then either keep the subscription or report an exit that already happened.
    fn follow(&mut self, session: &Session, attachment: Attachment, replies: &mut Vec<Outbound>) {
        let Attachment {
            history,
            exit_code,
            subscription,
        } = attachment;

        if !history.is_empty() {
            replies.push(Outbound::Output(history));
        }
        match exit_code {
            Some(exit_code) => replies.push(
                ServerMessage::SessionExit {
                    session_id: session.id().to_string(),
                    exit_code,
                }
                .into(),
            ),
            None => {
                debug!("Attached to session {}", session.id());
                self.attached = Some(subscription);
            }
        }
    }

    fn attached_handle(&self) -> Option<Arc<Session>> {
        let session_id = self.attached_session()?;
        self.registry.get(session_id)
    }

    /// Ignored unless attached.
    fn resize(&self, cols: u16, rows: u16) {
        if let Some(session) = self.attached_handle() {
            session.resize(cols, rows);
        }
    }

    /// Forward raw keystrokes to the attached session; dropped otherwise.
    pub fn handle_input(&self, data: &[u8]) {
        if !self.authenticated {
            return;
        }
        if let Some(session) = self.attached_handle() {
            session.write(data);
        }
    }

    /// Next live event of the attached session. Pending forever while detached.
    ///
    /// Returns `None` when the session disappeared without an exit event; the
    /// connection is detached in that case.
    pub async fn next_event(&mut self) -> Option<Outbound> {
        let Some(subscription) = self.attached.as_mut() else {
            return std::future::pending().await;
        };
        match subscription.recv().await {
            Some(SessionEvent::Output(chunk)) => Some(Outbound::Output(chunk)),
            Some(SessionEvent::Exit(exit_code)) => {
                let session_id = subscription.session_id().to_string();
                self.attached = None;
                Some(
                    ServerMessage::SessionExit {
                        session_id,
                        exit_code,
                    }
                    .into(),
                )
            }
            None => {
                self.attached = None;
                None
            }
        }
    }

    /// Release the current subscription, if any. The session keeps running.
    pub fn detach(&mut self) {
        if let Some(subscription) = self.attached.take() {
            debug!("Detached from session {}", subscription.session_id());
        }
    }
}

/// Expand `~` and make the requested directory absolute, defaulting to `default`.
pub fn resolve_cwd(requested: Option<&str>, default: &Path) -> PathBuf {
    let Some(requested) = requested.map(str::trim).filter(|p| !p.is_empty()) else {
        return default.to_path_buf();
    };

    let path = match (requested, dirs::home_dir()) {
        ("~", Some(home)) => home,
        (path, Some(home)) if path.starts_with("~/") => home.join(&path[2..]),
        ("~", None) => return default.to_path_buf(),
        (path, _) => PathBuf::from(path),
    };

    if path.is_absolute() {
        path
    } else {
        default.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::pty::testing::FakeSpawner;
    use crate::pty::TerminalSize;

    struct StaticToken(&'static str);

    impl TokenValidator for StaticToken {
        fn validate(&self, token: &str) -> bool {
            token == self.0
        }
    }

    struct Harness {
        spawner: Arc<FakeSpawner>,
        registry: Arc<SessionRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            let spawner = Arc::new(FakeSpawner::default());
            let registry = Arc::new(SessionRegistry::new(spawner.clone(), 1024));
            Self { spawner, registry }
        }

        fn connection(&self) -> Connection {
            Connection::new(
                self.registry.clone(),
                Arc::new(StaticToken("secret")),
                PathBuf::from("/home/default"),
            )
        }

        async fn authenticated(&self) -> Connection {
            let mut conn = self.connection();
            let replies = send(&mut conn, json!({"type": "auth", "token": "secret"})).await;
            assert_eq!(replies, vec![ServerMessage::AuthSuccess {}.into()]);
            conn
        }
    }

    async fn send(conn: &mut Connection, message: serde_json::Value) -> Vec<Outbound> {
        conn.handle_control(message.to_string().as_bytes()).await
    }

    async fn next(conn: &mut Connection) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), conn.next_event())
            .await
            .expect("no event within timeout")
            .expect("subscription closed")
    }

    fn error(text: &str) -> Outbound {
        ServerMessage::Error {
            error: text.to_string(),
        }
        .into()
    }

    fn created_id(replies: &[Outbound]) -> String {
        match &replies[0] {
            Outbound::Control(ServerMessage::SessionCreated { session }) => session.id.clone(),
            other => panic!("expected session:created, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_before_auth_is_rejected_then_auth_succeeds() {
        let harness = Harness::new();
        let mut conn = harness.connection();

        let replies = send(&mut conn, json!({"type": "resize", "cols": 80, "rows": 24})).await;
        assert_eq!(replies, vec![error("Not authenticated")]);
        let replies = send(&mut conn, json!({"type": "session:create"})).await;
        assert_eq!(replies, vec![error("Not authenticated")]);
        assert_eq!(harness.spawner.spawn_count(), 0);

        let replies = send(&mut conn, json!({"type": "auth", "token": "secret"})).await;
        assert_eq!(replies, vec![ServerMessage::AuthSuccess {}.into()]);
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn failed_auth_leaves_connection_usable() {
        let harness = Harness::new();
        let mut conn = harness.connection();

        let replies = send(&mut conn, json!({"type": "auth", "token": "nope"})).await;
        assert_eq!(
            replies,
            vec![
                ServerMessage::AuthFailed {
                    error: "Invalid token".into()
                }
                .into()
            ]
        );
        let replies = send(&mut conn, json!({"type": "auth"})).await;
        assert!(matches!(
            replies[0],
            Outbound::Control(ServerMessage::AuthFailed { .. })
        ));
        assert!(!conn.is_authenticated());

        let replies = send(&mut conn, json!({"type": "auth", "token": "secret"})).await;
        assert_eq!(replies, vec![ServerMessage::AuthSuccess {}.into()]);
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_report_errors() {
        let harness = Harness::new();
        let mut conn = harness.authenticated().await;

        let replies = send(&mut conn, json!({"type": "session:rename"})).await;
        assert_eq!(replies, vec![error("Unknown message type: session:rename")]);
        let replies = conn.handle_control(b"{oops").await;
        assert_eq!(replies, vec![error("Invalid control message")]);
    }

    #[tokio::test]
    async fn create_spawns_in_resolved_cwd_and_attaches() {
        let harness = Harness::new();
        let mut conn = harness.authenticated().await;

        let replies = send(&mut conn, json!({"type": "session:create", "cwd": "project"})).await;
        assert_eq!(replies.len(), 1);
        let id = created_id(&replies);
        assert_eq!(conn.attached_session(), Some(id.as_str()));
        assert_eq!(
            harness.spawner.pty(0).log.lock().unwrap().cwd,
            PathBuf::from("/home/default/project")
        );

        let replies = send(&mut conn, json!({"type": "session:list"})).await;
        match &replies[..] {
            [Outbound::Control(ServerMessage::SessionList { sessions })] => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, id);
            }
            other => panic!("unexpected replies {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_replays_history_before_live_output() {
        let harness = Harness::new();
        let mut owner = harness.authenticated().await;
        let id = created_id(&send(&mut owner, json!({"type": "session:create"})).await);
        let pty = harness.spawner.pty(0);

        pty.emit("ab").await;
        assert_eq!(next(&mut owner).await, Outbound::Output(Bytes::from_static(b"ab")));

        let mut viewer = harness.authenticated().await;
        let replies = send(&mut viewer, json!({"type": "session:attach", "sessionId": id})).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            &replies[0],
            Outbound::Control(ServerMessage::SessionAttached { session }) if session.id == id
        ));
        assert_eq!(replies[1], Outbound::Output(Bytes::from_static(b"ab")));

        pty.emit("cd").await;
        assert_eq!(next(&mut viewer).await, Outbound::Output(Bytes::from_static(b"cd")));
    }

    #[tokio::test]
    async fn attach_to_missing_session_keeps_state() {
        let harness = Harness::new();
        let mut conn = harness.authenticated().await;
        let id = created_id(&send(&mut conn, json!({"type": "session:create"})).await);

        let replies = send(&mut conn, json!({"type": "session:attach", "sessionId": "gone"})).await;
        assert_eq!(replies, vec![error("Session not found")]);
        assert_eq!(conn.attached_session(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn output_fans_out_and_survives_a_detach() {
        let harness = Harness::new();
        let mut first = harness.authenticated().await;
        let id = created_id(&send(&mut first, json!({"type": "session:create"})).await);
        let mut second = harness.authenticated().await;
        send(&mut second, json!({"type": "session:attach", "sessionId": id})).await;
        let pty = harness.spawner.pty(0);

        pty.emit("one").await;
        pty.emit("two").await;
        for conn in [&mut first, &mut second] {
            assert_eq!(next(conn).await, Outbound::Output(Bytes::from_static(b"one")));
            assert_eq!(next(conn).await, Outbound::Output(Bytes::from_static(b"two")));
        }

        first.detach();
        first.detach();
        pty.emit("three").await;
        assert_eq!(next(&mut second).await, Outbound::Output(Bytes::from_static(b"three")));
        assert!(harness.registry.get(&id).is_some());
    }

    #[tokio::test]
    async fn input_and_resize_require_an_attachment() {
        let harness = Harness::new();
        let mut conn = harness.authenticated().await;

        conn.handle_input(b"ignored");
        let replies = send(&mut conn, json!({"type": "resize", "cols": 90, "rows": 30})).await;
        assert!(replies.is_empty());

        send(&mut conn, json!({"type": "session:create"})).await;
        conn.handle_input(b"ls\r");
        send(&mut conn, json!({"type": "resize", "cols": 90, "rows": 30})).await;
        send(&mut conn, json!({"type": "resize", "cols": 0, "rows": 30})).await;

        let pty = harness.spawner.pty(0);
        assert_eq!(pty.input(), b"ls\r");
        assert_eq!(pty.resizes(), vec![TerminalSize { cols: 90, rows: 30 }]);
    }

    #[tokio::test]
    async fn input_before_auth_is_dropped() {
        let harness = Harness::new();
        let mut owner = harness.authenticated().await;
        let id = created_id(&send(&mut owner, json!({"type": "session:create"})).await);

        let mut stranger = harness.connection();
        send(&mut stranger, json!({"type": "session:attach", "sessionId": id})).await;
        stranger.handle_input(b"rm -rf /\r");
        assert!(harness.spawner.pty(0).input().is_empty());
    }

    #[tokio::test]
    async fn destroy_acknowledges_and_notifies_viewers() {
        let harness = Harness::new();
        let mut viewer = harness.authenticated().await;
        let id = created_id(&send(&mut viewer, json!({"type": "session:create"})).await);
        let mut admin = harness.authenticated().await;

        let replies = send(&mut admin, json!({"type": "session:destroy", "sessionId": id})).await;
        assert_eq!(
            replies,
            vec![ServerMessage::SessionDestroyed { session_id: id.clone() }.into()]
        );
        let replies = send(&mut admin, json!({"type": "session:destroy", "sessionId": id})).await;
        assert_eq!(replies.len(), 1);

        assert_eq!(
            next(&mut viewer).await,
            ServerMessage::SessionExit {
                session_id: id.clone(),
                exit_code: 129
            }
            .into()
        );
        assert_eq!(viewer.attached_session(), None);
        assert!(harness.registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn resize_after_exit_is_silent() {
        let harness = Harness::new();
        let mut conn = harness.authenticated().await;
        send(&mut conn, json!({"type": "session:create"})).await;
        let pty = harness.spawner.pty(0);

        pty.exit(0).await;
        assert!(matches!(
            next(&mut conn).await,
            Outbound::Control(ServerMessage::SessionExit { exit_code: 0, .. })
        ));

        let replies = send(&mut conn, json!({"type": "resize", "cols": 100, "rows": 40})).await;
        assert!(replies.is_empty());
        assert!(pty.resizes().is_empty());
    }

    #[tokio::test]
    async fn create_reports_spawn_failure_as_exit() {
        let registry = Arc::new(SessionRegistry::new(Arc::new(FakeSpawner::failing()), 1024));
        let mut conn = Connection::new(registry, Arc::new(StaticToken("t")), PathBuf::from("/"));
        send(&mut conn, json!({"type": "auth", "token": "t"})).await;

        let replies = send(&mut conn, json!({"type": "session:create"})).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            &replies[1],
            Outbound::Control(ServerMessage::SessionExit { exit_code: 1, .. })
        ));
        assert_eq!(conn.attached_session(), None);
    }

    #[test]
    fn resolve_cwd_expands_home_and_defaults() {
        let default = Path::new("/work");
        assert_eq!(resolve_cwd(None, default), PathBuf::from("/work"));
        assert_eq!(resolve_cwd(Some("  "), default), PathBuf::from("/work"));
        assert_eq!(resolve_cwd(Some("/etc"), default), PathBuf::from("/etc"));
        assert_eq!(resolve_cwd(Some("src"), default), PathBuf::from("/work/src"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_cwd(Some("~"), default), home);
            assert_eq!(resolve_cwd(Some("~/code"), default), home.join("code"));
        }
    }
}
