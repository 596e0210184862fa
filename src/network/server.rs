//! WebSocket Game Server
//!
//! Accepts connections, runs one handler task per connection and a single
//! tick scheduler task, and coordinates shutdown between them.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::game::directory::{SessionDirectory, SharedDirectory};
use crate::game::session::{IdleLogic, PlayerId, SessionId, SessionLogic};
use crate::game::tick::TickScheduler;
use crate::network::connection::{ClientRegistry, ConnectedClient, ConnectionHandler};
use crate::network::http;
use crate::network::router::CommandRouter;
use crate::{DEFAULT_PORT, SESSION_CAPACITY, TICK_RATE};

/// Pause after a failed accept so persistent errors do not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for connections to close before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// Status HTTP bind address; disabled when `None`.
    pub http_addr: Option<SocketAddr>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Tick rate for session advancement (Hz).
    pub tick_rate: u32,
    /// Players per session.
    pub session_capacity: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            http_addr: None,
            max_connections: 1000,
            tick_rate: TICK_RATE,
            session_capacity: SESSION_CAPACITY,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), GameServerError> {
        if self.tick_rate == 0 {
            return Err(GameServerError::InvalidConfig("tick rate must be at least 1 Hz".to_string()));
        }
        if self.session_capacity == 0 {
            return Err(GameServerError::InvalidConfig("session capacity must be at least 1".to_string()));
        }
        if self.max_connections == 0 {
            return Err(GameServerError::InvalidConfig("max connections must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind a listening socket.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// I/O error on an already bound socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared session state.
    directory: SharedDirectory,
    /// Connected clients.
    clients: ClientRegistry,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl GameServer {
    /// Create a new game server with idle session logic.
    pub fn new(config: ServerConfig) -> Self {
        let directory = SessionDirectory::with_logic(
            config.session_capacity,
            Arc::new(|_: SessionId| -> Box<dyn SessionLogic> { Box::new(IdleLogic) }),
        );
        Self::with_directory(config, directory.into_shared())
    }

    /// Create a server over an existing directory (custom session logic).
    pub fn with_directory(config: ServerConfig, directory: SharedDirectory) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            directory,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared session state.
    pub fn directory(&self) -> SharedDirectory {
        self.directory.clone()
    }

    /// Bind the WebSocket listener. Failing here is the only fatal error.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| GameServerError::Bind {
                addr: self.config.bind_addr,
                source,
            })
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        self.config.validate()?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`GameServer::shutdown`] is called.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let local_addr = listener.local_addr()?;
        info!("Game server listening on {}", local_addr);

        let status_listener = match self.config.http_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| GameServerError::Bind { addr, source })?,
            ),
            None => None,
        };

        let (tick_stop_tx, tick_stop_rx) = broadcast::channel(1);
        let (close_tx, _) = broadcast::channel::<()>(1);

        let scheduler = TickScheduler::new(self.directory.clone(), self.config.tick_rate);
        let tick_handle = tokio::spawn(scheduler.run(tick_stop_rx).instrument(info_span!("ticker")));

        let status_handle = status_listener.map(|listener| {
            if let Ok(addr) = listener.local_addr() {
                info!("Status endpoint listening on http://{}", addr);
            }
            let directory = self.directory.clone();
            let mut stop_rx = close_tx.subscribe();
            tokio::spawn(async move {
                let shutdown = async move {
                    let _ = stop_rx.recv().await;
                };
                if let Err(e) = http::serve(listener, directory, shutdown).await {
                    error!("Status endpoint failed: {}", e);
                }
            })
        });

        let router = CommandRouter::new(self.directory.clone());
        let mut connections = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stopped = *shutdown_rx.borrow();

        while !stopped {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            let id = Uuid::new_v4();
                            self.clients.write().await.insert(id, ConnectedClient {
                                peer: addr,
                                player: None,
                                connected_at: Utc::now(),
                            });

                            let handler = ConnectionHandler::new(id, addr, router.clone(), self.clients.clone());
                            let clients = self.clients.clone();
                            let close_rx = close_tx.subscribe();
                            let span = info_span!("connection", %id, peer = %addr);

                            connections.spawn(async move {
                                handler.run(stream, close_rx).await;
                                clients.write().await.remove(&id);
                            }.instrument(span));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Stop accepting, stop ticking, then close every connection.
        drop(listener);

        let _ = tick_stop_tx.send(());
        if let Err(e) = tick_handle.await {
            error!("Tick scheduler task failed: {}", e);
        }

        let _ = close_tx.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, drain(&mut connections)).await.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                SHUTDOWN_GRACE
            );
            connections.abort_all();
            drain(&mut connections).await;
            self.evict_stranded(&router).await;
        }

        if let Some(handle) = status_handle {
            if let Err(e) = handle.await {
                error!("Status endpoint task failed: {}", e);
            }
        }

        info!("Game server stopped");
        Ok(())
    }

    /// Leave on behalf of connections whose tasks were aborted before cleanup.
    async fn evict_stranded(&self, router: &CommandRouter) {
        let stranded: Vec<PlayerId> = {
            let mut clients = self.clients.write().await;
            let players = clients.values().filter_map(|c| c.player.clone()).collect();
            clients.clear();
            players
        };

        for player in stranded {
            if let Some(session) = router.disconnect(&player).await {
                info!("{} evicted from game {} at shutdown", player, session);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get live session count.
    pub async fn session_count(&self) -> usize {
        self.directory.lock().await.session_count()
    }

    /// Get joined player count.
    pub async fn player_count(&self) -> usize {
        self.directory.lock().await.player_count()
    }
}

async fn drain(connections: &mut JoinSet<()>) {
    while let Some(result) = connections.join_next().await {
        match result {
            Err(e) if !e.is_cancelled() => error!("Connection task failed: {}", e),
            _ => {}
        }
    }
}
