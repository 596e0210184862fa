//! Game Module
//!
//! Session state and its fixed-rate advancement. Transport-agnostic.
//!
//! ## Module Structure
//!
//! - `session`: one bounded game instance and its pluggable logic
//! - `directory`: registry of live sessions with the player reverse index
//! - `tick`: fixed-rate scheduler that advances and reaps sessions

pub mod directory;
pub mod session;
pub mod tick;

// Re-export key types
pub use directory::{DirectoryError, LogicFactory, PlayerEntry, SessionDirectory, SharedDirectory};
pub use session::{IdleLogic, PlayerId, Session, SessionError, SessionId, SessionLogic, TickStatus};
pub use tick::{TickReport, TickScheduler};
