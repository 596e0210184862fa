//! Command Router
//!
//! Turns parsed commands into directory operations. Knows nothing about
//! JSON or sockets; the connection layer wraps outcomes for the wire.

use tracing::debug;

use crate::game::directory::{DirectoryError, SharedDirectory};
use crate::game::session::{PlayerId, SessionId};
use crate::network::protocol::{Command, ProtocolError, ServerMessage};

/// Successful command outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Player joined a session.
    Joined {
        /// Player that joined.
        player: PlayerId,
        /// Session joined.
        session: SessionId,
    },
    /// Move applied.
    Moved {
        /// Player that moved.
        player: PlayerId,
        /// Move argument.
        direction: String,
        /// Session the move went to.
        session: SessionId,
    },
    /// Session description.
    State {
        /// Session described.
        session: SessionId,
        /// Description text.
        description: String,
    },
    /// Player left a session.
    Left {
        /// Player that left.
        player: PlayerId,
        /// Session left.
        session: SessionId,
    },
}

/// Reasons a frame produced no outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// Frame did not parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Directory refused the operation.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Command names an identity other than the one bound to the connection.
    #[error("player {requested} does not belong to this connection")]
    ForeignIdentity {
        /// Identity bound to the connection.
        bound: PlayerId,
        /// Identity named in the command.
        requested: PlayerId,
    },

    /// Identity already held by another live connection.
    #[error("player {0} belongs to another connection")]
    IdentityTaken(PlayerId),
}

impl From<&Outcome> for ServerMessage {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Joined { session, .. } => {
                ServerMessage::ok("join", format!("Joined game {session}"), Some(*session))
            }
            Outcome::Moved { player, direction, session } => {
                ServerMessage::ok("move", format!("{player} made a move: {direction}"), Some(*session))
            }
            Outcome::State { session, description } => {
                ServerMessage::ok("state", description.clone(), Some(*session))
            }
            Outcome::Left { session, .. } => {
                ServerMessage::ok("leave", format!("Left game {session}"), Some(*session))
            }
        }
    }
}

impl From<&RouteError> for ServerMessage {
    fn from(error: &RouteError) -> Self {
        ServerMessage::error(error.to_string())
    }
}

impl From<&Result<Outcome, RouteError>> for ServerMessage {
    fn from(result: &Result<Outcome, RouteError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(error) => error.into(),
        }
    }
}

/// Dispatches commands against the shared directory.
#[derive(Clone)]
pub struct CommandRouter {
    directory: SharedDirectory,
}

impl CommandRouter {
    /// Create a router over a shared directory.
    pub fn new(directory: SharedDirectory) -> Self {
        Self { directory }
    }

    /// Parse and dispatch a raw frame.
    pub async fn route(&self, frame: &str) -> Result<Outcome, RouteError> {
        let command = Command::parse(frame)?;
        self.dispatch(command).await
    }

    /// Dispatch a parsed command. The directory lock is held for the whole
    /// operation.
    pub async fn dispatch(&self, command: Command) -> Result<Outcome, RouteError> {
        let mut directory = self.directory.lock().await;

        let outcome = match command {
            Command::Join { player } => {
                let session = directory.join(player.clone())?;
                Outcome::Joined { player, session }
            }
            Command::Move { player, direction } => {
                let session = directory.player_move(&player, &direction)?;
                Outcome::Moved {
                    player,
                    direction,
                    session,
                }
            }
            Command::State { player } => {
                let description = directory.state(&player)?;
                let session = directory
                    .find_by_member(&player)
                    .map(|s| s.id())
                    .ok_or(DirectoryError::NotInGame)?;
                Outcome::State {
                    session,
                    description,
                }
            }
            Command::Leave { player } => {
                let session = directory.leave(&player)?;
                Outcome::Left { player, session }
            }
        };

        debug!("Routed {:?}", outcome);
        Ok(outcome)
    }

    /// Implicit leave for a closing connection. Not being in a game is fine.
    pub async fn disconnect(&self, player: &PlayerId) -> Option<SessionId> {
        let mut directory = self.directory.lock().await;
        directory.leave(player).ok()
    }
}
