//! # Gravitag Session Server
//!
//! Authoritative multiplayer session server for Gravitag Online.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    GRAVITAG SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/             - Session state (transport-agnostic)      │
//! │  ├── session.rs    - One bounded game instance               │
//! │  ├── directory.rs  - Live sessions + player reverse index    │
//! │  └── tick.rs       - Fixed-rate advancement and reaping      │
//! │                                                              │
//! │  network/          - Networking                              │
//! │  ├── protocol.rs   - Text commands and JSON envelope         │
//! │  ├── router.rs     - Command dispatch                        │
//! │  ├── connection.rs - Per-connection frame loop               │
//! │  ├── server.rs     - WebSocket server and shutdown           │
//! │  └── http.rs       - Read-only status endpoint               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Every connection runs its own task and the tick scheduler runs in
//! another. They share only the [`SessionDirectory`], behind one mutex.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;

// Re-export commonly used types
pub use game::{PlayerId, Session, SessionDirectory, SessionId, SessionLogic, TickScheduler};
pub use network::{CommandRouter, GameServer, ServerConfig, ServerMessage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tick rate (Hz)
pub const TICK_RATE: u32 = 60;

/// Default players per session
pub const SESSION_CAPACITY: usize = 4;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 6969;
