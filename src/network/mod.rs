//! Network Layer
//!
//! WebSocket server, text protocol and command routing. Session state lives
//! in `game/`; this layer only moves frames in and out of it.

pub mod connection;
pub mod http;
pub mod protocol;
pub mod router;
pub mod server;

pub use connection::{ClientRegistry, ConnectedClient, ConnectionHandler, ConnectionState};
pub use protocol::{Command, ProtocolError, ServerMessage};
pub use router::{CommandRouter, Outcome, RouteError};
pub use server::{GameServer, GameServerError, ServerConfig};
