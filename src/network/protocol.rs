//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Requests are colon-delimited text (`command:playerId[:argument]`);
//! responses are a small JSON envelope.

use serde::{Deserialize, Serialize};

use crate::game::session::{PlayerId, SessionId};

/// Field separator in request frames.
pub const FIELD_SEPARATOR: char = ':';

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join the first session with room.
    Join {
        /// Player issuing the command.
        player: PlayerId,
    },

    /// Apply a move in the player's session.
    Move {
        /// Player issuing the command.
        player: PlayerId,
        /// Move argument, e.g. `left`.
        direction: String,
    },

    /// Describe the player's session.
    State {
        /// Player issuing the command.
        player: PlayerId,
    },

    /// Leave the player's session.
    Leave {
        /// Player issuing the command.
        player: PlayerId,
    },
}

/// Request frames that do not form a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Fewer than two fields, or an unusable player id.
    #[error("invalid message format")]
    InvalidFormat,

    /// Command needs an argument that was not supplied.
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    /// Command name not recognized.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

impl Command {
    /// Parse a request frame.
    ///
    /// At most three fields are split off; the argument keeps any further
    /// separators. An empty argument counts as missing.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let mut fields = frame.trim().splitn(3, FIELD_SEPARATOR);

        let name = fields.next().unwrap_or_default();
        let player = fields
            .next()
            .and_then(PlayerId::parse)
            .ok_or(ProtocolError::InvalidFormat)?;
        let argument = fields.next().filter(|arg| !arg.is_empty());

        match name {
            "join" => Ok(Command::Join { player }),
            "move" => {
                let direction = argument.ok_or(ProtocolError::MissingArgument("move"))?;
                Ok(Command::Move {
                    player,
                    direction: direction.to_string(),
                })
            }
            "state" => Ok(Command::State { player }),
            "leave" => Ok(Command::Leave { player }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Player the command acts on.
    pub fn player(&self) -> &PlayerId {
        match self {
            Command::Join { player }
            | Command::Move { player, .. }
            | Command::State { player }
            | Command::Leave { player } => player,
        }
    }

    /// Command name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Move { .. } => "move",
            Command::State { .. } => "state",
            Command::Leave { .. } => "leave",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Envelope tag for error responses.
pub const ERROR_TAG: &str = "error";

/// Response envelope sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Outcome tag: the command name on success, `error` otherwise.
    pub command: String,
    /// Human-readable payload.
    pub message: String,
    /// Session the outcome refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
}

impl ServerMessage {
    /// Successful outcome.
    pub fn ok(command: &str, message: impl Into<String>, session: Option<SessionId>) -> Self {
        Self {
            command: command.to_string(),
            message: message.into(),
            session,
        }
    }

    /// Error outcome.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            command: ERROR_TAG.to_string(),
            message: message.into(),
            session: None,
        }
    }

    /// Whether this is an error response.
    pub fn is_error(&self) -> bool {
        self.command == ERROR_TAG
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
