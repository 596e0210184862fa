//! Connection Handler
//!
//! One sequential receive/send loop per WebSocket connection. Frames from a
//! connection are routed in the order they arrive; closing the connection
//! performs an implicit leave for the identity it joined with.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::game::directory::DirectoryError;
use crate::game::session::PlayerId;
use crate::network::protocol::{Command, ProtocolError, ServerMessage};
use crate::network::router::{CommandRouter, Outcome, RouteError};

/// Time a peer gets to complete the WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a single outgoing frame may take, close frame included.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport handshake in progress.
    Connecting,
    /// Handshake done; frames flow.
    Open,
    /// Cleanup in progress; no more writes.
    Closing,
    /// Done.
    Closed,
}

/// Connected client, as tracked by the server.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Peer address.
    pub peer: SocketAddr,
    /// Identity bound by the first successful join.
    pub player: Option<PlayerId>,
    /// Connection time.
    pub connected_at: DateTime<Utc>,
}

/// Live connections keyed by connection id.
pub type ClientRegistry = Arc<RwLock<BTreeMap<Uuid, ConnectedClient>>>;

/// Per-connection loop.
pub struct ConnectionHandler {
    id: Uuid,
    peer: SocketAddr,
    router: CommandRouter,
    clients: ClientRegistry,
    state: ConnectionState,
    bound: Option<PlayerId>,
}

impl ConnectionHandler {
    /// Create a handler for a freshly accepted connection.
    pub fn new(id: Uuid, peer: SocketAddr, router: CommandRouter, clients: ClientRegistry) -> Self {
        Self {
            id,
            peer,
            router,
            clients,
            state: ConnectionState::Connecting,
            bound: None,
        }
    }

    /// Connection id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity bound to this connection, if any.
    pub fn bound_player(&self) -> Option<&PlayerId> {
        self.bound.as_ref()
    }

    /// Run the WebSocket handshake and the frame loop until the peer leaves,
    /// the transport fails, or `shutdown` fires.
    pub async fn run<S>(mut self, stream: S, mut shutdown: broadcast::Receiver<()>) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake = tokio::select! {
            result = timeout(HANDSHAKE_TIMEOUT, accept_async(stream)) => result,
            _ = shutdown.recv() => {
                debug!("Shutdown during handshake with {}", self.peer);
                self.state = ConnectionState::Closed;
                return self.state;
            }
        };

        let mut ws = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake failed for {}: {}", self.peer, e);
                self.state = ConnectionState::Closed;
                return self.state;
            }
            Err(_) => {
                warn!("WebSocket handshake with {} timed out", self.peer);
                self.state = ConnectionState::Closed;
                return self.state;
            }
        };

        self.state = ConnectionState::Open;
        info!("Client {} connected", self.peer);

        while self.state == ConnectionState::Open {
            let frame = tokio::select! {
                frame = ws.next() => frame,
                _ = shutdown.recv() => {
                    debug!("Closing {} for shutdown", self.peer);
                    break;
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    self.handle_text(&mut ws, &text).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(&mut ws, &text).await,
                    Err(_) => {
                        let error = RouteError::from(ProtocolError::InvalidFormat);
                        self.send(&mut ws, ServerMessage::from(&error)).await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {}", self.peer, e);
                    break;
                }
            }
        }

        self.state = ConnectionState::Closing;

        if let Some(player) = self.bound.take() {
            self.release().await;
            if let Some(session) = self.router.disconnect(&player).await {
                info!("{} dropped from game {} on disconnect", player, session);
            }
        }

        match timeout(WRITE_TIMEOUT, ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close handshake with {} ended early: {}", self.peer, e),
            Err(_) => debug!("Close handshake with {} timed out", self.peer),
        }

        self.state = ConnectionState::Closed;
        info!("Client {} cleaned up", self.peer);
        self.state
    }

    async fn handle_text<S>(&mut self, ws: &mut WebSocketStream<S>, text: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.route(text).await;

        match &result {
            Ok(Outcome::Joined { player, .. }) if self.bound.is_none() => {
                debug!("Connection {} bound to {}", self.id, player);
                self.bound = Some(player.clone());
            }
            Ok(Outcome::Left { player, .. }) => {
                debug!("Connection {} released {}", self.id, player);
                self.bound = None;
                self.release().await;
            }
            Ok(_) => {}
            Err(e) => debug!("Rejected {:?} from {}: {}", text, self.peer, e),
        }

        self.send(ws, ServerMessage::from(&result)).await;
    }

    /// Commands from a bound connection must name its identity. An unbound
    /// connection may only join, and only with an identity no other live
    /// connection holds.
    async fn route(&self, text: &str) -> Result<Outcome, RouteError> {
        let command = Command::parse(text)?;

        match &self.bound {
            Some(bound) if command.player() != bound => Err(RouteError::ForeignIdentity {
                bound: bound.clone(),
                requested: command.player().clone(),
            }),
            Some(_) => self.router.dispatch(command).await,
            None => match command {
                Command::Join { player } => {
                    self.claim(&player).await?;
                    let result = self.router.dispatch(Command::Join { player }).await;
                    if result.is_err() {
                        self.release().await;
                    }
                    result
                }
                _ => Err(DirectoryError::NotInGame.into()),
            },
        }
    }

    /// Reserve an identity for this connection in the registry.
    async fn claim(&self, player: &PlayerId) -> Result<(), RouteError> {
        let mut clients = self.clients.write().await;
        let taken = clients
            .iter()
            .any(|(id, client)| *id != self.id && client.player.as_ref() == Some(player));
        if taken {
            return Err(RouteError::IdentityTaken(player.clone()));
        }

        if let Some(client) = clients.get_mut(&self.id) {
            client.player = Some(player.clone());
        }
        Ok(())
    }

    async fn release(&self) {
        if let Some(client) = self.clients.write().await.get_mut(&self.id) {
            client.player = None;
        }
    }

    /// Write a response. Suppressed once the connection is no longer open;
    /// a failed or stalled write starts the close path and is never retried.
    async fn send<S>(&mut self, ws: &mut WebSocketStream<S>, message: ServerMessage)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != ConnectionState::Open {
            debug!("Suppressed write to {:?} connection {}", self.state, self.peer);
            return;
        }

        let text = match message.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                return;
            }
        };

        match timeout(WRITE_TIMEOUT, ws.send(Message::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", self.peer, e);
                self.state = ConnectionState::Closing;
            }
            Err(_) => {
                warn!("Write to {} timed out", self.peer);
                self.state = ConnectionState::Closing;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::directory::{SessionDirectory, SharedDirectory};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::client_async;

    struct Harness {
        directory: SharedDirectory,
        clients: ClientRegistry,
        shutdown: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown, _) = broadcast::channel(1);
            Self {
                directory: SessionDirectory::new().into_shared(),
                clients: Arc::new(RwLock::new(BTreeMap::new())),
                shutdown,
            }
        }

        /// Spawn a handler on an in-memory stream without handshaking.
        async fn spawn_raw(&self) -> (DuplexStream, Uuid, JoinHandle<ConnectionState>) {
            let (server_io, client_io) = tokio::io::duplex(4096);
            let id = Uuid::new_v4();
            let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();

            self.clients.write().await.insert(
                id,
                ConnectedClient {
                    peer,
                    player: None,
                    connected_at: Utc::now(),
                },
            );

            let handler = ConnectionHandler::new(
                id,
                peer,
                CommandRouter::new(self.directory.clone()),
                self.clients.clone(),
            );
            assert_eq!(handler.state(), ConnectionState::Connecting);

            let task = tokio::spawn(handler.run(server_io, self.shutdown.subscribe()));
            (client_io, id, task)
        }

        async fn connect(&self) -> (WebSocketStream<DuplexStream>, Uuid, JoinHandle<ConnectionState>) {
            let (client_io, id, task) = self.spawn_raw().await;
            let (ws, _) = client_async("ws://localhost/", client_io).await.unwrap();
            (ws, id, task)
        }

        async fn bound(&self, id: Uuid) -> Option<PlayerId> {
            self.clients.read().await.get(&id).and_then(|c| c.player.clone())
        }
    }

    async fn request(ws: &mut WebSocketStream<DuplexStream>, frame: &str) -> ServerMessage {
        ws.send(Message::Text(frame.to_string())).await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return ServerMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_websocket() {
        let harness = Harness::new();
        let (mut ws, id, _task) = harness.connect().await;

        let joined = request(&mut ws, "join:alice").await;
        assert_eq!(joined.command, "join");
        assert_eq!(joined.session, Some(crate::game::SessionId(0)));

        let state = request(&mut ws, "state:alice").await;
        assert_eq!(state.message, "Game 0 has 1 players");

        assert_eq!(harness.bound(id).await, PlayerId::parse("alice"));
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let harness = Harness::new();
        let (mut ws, _, _task) = harness.connect().await;

        assert_eq!(request(&mut ws, "garbage").await.message, "invalid message format");
        assert_eq!(request(&mut ws, "jump:alice").await.message, "unknown command: jump");
        assert_eq!(request(&mut ws, "move:alice").await.message, "move requires an argument");
        assert_eq!(request(&mut ws, "move:alice:left").await.message, "player is not in a game");

        // Still usable.
        assert_eq!(request(&mut ws, "join:alice").await.command, "join");
    }

    #[tokio::test]
    async fn test_binary_frames_are_read_as_text() {
        let harness = Harness::new();
        let (mut ws, _, _task) = harness.connect().await;

        ws.send(Message::Binary(b"join:alice".to_vec())).await.unwrap();
        let reply = loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                break ServerMessage::from_json(&text).unwrap();
            }
        };
        assert_eq!(reply.command, "join");

        ws.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
        let reply = loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                break ServerMessage::from_json(&text).unwrap();
            }
        };
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_foreign_identity_rejected() {
        let harness = Harness::new();
        let (mut alice, _, _a) = harness.connect().await;
        let (mut bob, _, _b) = harness.connect().await;

        request(&mut alice, "join:alice").await;
        request(&mut bob, "join:bob").await;

        let reply = request(&mut alice, "leave:bob").await;
        assert_eq!(reply.message, "player bob does not belong to this connection");
        assert_eq!(request(&mut bob, "state:bob").await.message, "Game 0 has 2 players");
    }

    #[tokio::test]
    async fn test_disconnect_performs_leave() {
        let harness = Harness::new();
        let (mut ws, _, task) = harness.connect().await;
        request(&mut ws, "join:alice").await;

        ws.close(None).await.unwrap();
        drop(ws);
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);

        let directory = harness.directory.lock().await;
        assert_eq!(
            directory.state(&PlayerId::parse("alice").unwrap()),
            Err(crate::game::DirectoryError::NotInGame)
        );
    }

    #[tokio::test]
    async fn test_disconnect_after_explicit_leave() {
        let harness = Harness::new();
        let (mut ws, _, task) = harness.connect().await;
        request(&mut ws, "join:alice").await;
        request(&mut ws, "leave:alice").await;

        // Rejoining with the bound identity is allowed.
        assert_eq!(request(&mut ws, "join:alice").await.command, "join");
        request(&mut ws, "leave:alice").await;

        drop(ws);
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(harness.directory.lock().await.player_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_leaves() {
        let harness = Harness::new();
        let (mut ws, _, task) = harness.connect().await;
        request(&mut ws, "join:alice").await;

        harness.shutdown.send(()).unwrap();
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(harness.directory.lock().await.player_count(), 0);

        // Client sees the close frame.
        let mut saw_close = false;
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Close(_) = msg {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_leave_releases_identity_for_other_connections() {
        let harness = Harness::new();
        let (mut first, first_id, first_task) = harness.connect().await;
        let (mut second, _, _second_task) = harness.connect().await;

        request(&mut first, "join:alice").await;
        request(&mut first, "leave:alice").await;
        assert_eq!(harness.bound(first_id).await, None);

        assert_eq!(request(&mut second, "join:alice").await.message, "Joined game 0");

        // Closing the first connection must not touch the second's alice.
        first.close(None).await.unwrap();
        drop(first);
        assert_eq!(first_task.await.unwrap(), ConnectionState::Closed);

        assert_eq!(request(&mut second, "state:alice").await.message, "Game 0 has 1 players");
    }

    #[tokio::test]
    async fn test_unjoined_connection_cannot_act_for_others() {
        let harness = Harness::new();
        let (mut owner, _, _owner_task) = harness.connect().await;
        let (mut stranger, stranger_id, _stranger_task) = harness.connect().await;
        request(&mut owner, "join:alice").await;

        for frame in ["leave:alice", "move:alice:left", "state:alice"] {
            let reply = request(&mut stranger, frame).await;
            assert_eq!(reply, ServerMessage::error("player is not in a game"));
        }
        assert_eq!(harness.bound(stranger_id).await, None);

        assert_eq!(request(&mut owner, "state:alice").await.message, "Game 0 has 1 players");
    }

    #[tokio::test]
    async fn test_identity_held_while_owner_is_connected() {
        let harness = Harness::new();
        let (mut owner, _, _owner_task) = harness.connect().await;
        let (mut other, other_id, _other_task) = harness.connect().await;
        request(&mut owner, "join:alice").await;

        // Session reaped underneath the owner; the name is still theirs.
        harness.directory.lock().await.remove(crate::game::SessionId(0));

        let reply = request(&mut other, "join:alice").await;
        assert_eq!(reply, ServerMessage::error("player alice belongs to another connection"));
        assert_eq!(harness.bound(other_id).await, None);

        assert_eq!(request(&mut owner, "join:alice").await.command, "join");
        assert_eq!(request(&mut other, "join:bob").await.command, "join");
    }

    #[tokio::test]
    async fn test_shutdown_during_handshake() {
        let harness = Harness::new();
        let (_silent, _, task) = harness.spawn_raw().await;

        harness.shutdown.send(()).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(state, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_handshake_times_out() {
        let harness = Harness::new();
        let (_silent, _, task) = harness.spawn_raw().await;

        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
    }
}
