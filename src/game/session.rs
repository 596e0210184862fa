//! Game Session
//!
//! One bounded-capacity game instance. Tracks its members in join order
//! and delegates per-tick advancement to a pluggable [`SessionLogic`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::SESSION_CAPACITY;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Player identity token, supplied by the client at join time.
///
/// Never empty and never contains `:` (the wire field separator).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    /// Parse an identity token, rejecting empty tokens and tokens containing `:`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.contains(':') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// Borrow the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier, assigned sequentially by the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// The identifier that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SESSION LOGIC
// =============================================================================

/// Result of advancing a session by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    /// Keep the session alive.
    Continue,
    /// The game is over; the scheduler reaps the session after this tick.
    Finished,
}

/// Game-specific behavior plugged into a session.
///
/// `on_tick` is the only way a session becomes finished.
pub trait SessionLogic: Send {
    /// A member issued a move.
    fn on_move(&mut self, _player: &PlayerId, _direction: &str) {}

    /// Advance the game by one tick. `tick` starts at 1.
    fn on_tick(&mut self, tick: u64, members: &[PlayerId]) -> TickStatus;
}

/// Default logic: accepts moves and never finishes.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleLogic;

impl SessionLogic for IdleLogic {
    fn on_tick(&mut self, _tick: u64, _members: &[PlayerId]) -> TickStatus {
        TickStatus::Continue
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Session errors.
///
/// The directory routes around both cases, so neither reaches a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Session is at capacity.
    #[error("Session {0} is full")]
    Full(SessionId),

    /// Player already a member.
    #[error("{player} is already in session {session}")]
    AlreadyMember {
        /// Session that already holds the player.
        session: SessionId,
        /// The duplicate player.
        player: PlayerId,
    },
}

/// A game session.
pub struct Session {
    id: SessionId,
    members: Vec<PlayerId>,
    capacity: usize,
    finished: bool,
    started_at: DateTime<Utc>,
    ticks: u64,
    logic: Box<dyn SessionLogic>,
}

impl Session {
    /// Create an empty session with the default capacity and idle logic.
    pub fn new(id: SessionId) -> Self {
        Self::with_logic(id, SESSION_CAPACITY, Box::new(IdleLogic))
    }

    /// Create an empty session with explicit capacity and logic.
    pub fn with_logic(id: SessionId, capacity: usize, logic: Box<dyn SessionLogic>) -> Self {
        let started_at = Utc::now();
        info!("Game {} started at {}", id, started_at.format("%H:%M:%S"));

        Self {
            id,
            members: Vec::with_capacity(capacity),
            capacity,
            finished: false,
            started_at,
            ticks: 0,
            logic,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Members in join order.
    pub fn members(&self) -> &[PlayerId] {
        &self.members
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Maximum number of members.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check membership.
    pub fn has_member(&self, player: &PlayerId) -> bool {
        self.members.contains(player)
    }

    /// Check if the session is at capacity.
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    /// Whether the game is over.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wall-clock creation time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Add a member.
    ///
    /// The caller owns any index pointing players at this session.
    pub fn add_member(&mut self, player: PlayerId) -> Result<(), SessionError> {
        if self.has_member(&player) {
            return Err(SessionError::AlreadyMember {
                session: self.id,
                player,
            });
        }

        if self.is_full() {
            return Err(SessionError::Full(self.id));
        }

        info!("{} joined game {}", player, self.id);
        self.members.push(player);
        Ok(())
    }

    /// Remove a member. Returns false if the player was not a member.
    pub fn remove_member(&mut self, player: &PlayerId) -> bool {
        match self.members.iter().position(|m| m == player) {
            Some(index) => {
                self.members.remove(index);
                info!("{} left game {}", player, self.id);
                true
            }
            None => false,
        }
    }

    /// Forward a move to the game logic.
    pub fn player_move(&mut self, player: &PlayerId, direction: &str) {
        debug!("{} made a move: {}", player, direction);
        self.logic.on_move(player, direction);
    }

    /// Human-readable summary. Clients parse this text.
    pub fn describe_state(&self) -> String {
        format!("Game {} has {} players", self.id, self.members.len())
    }

    /// Advance by one tick. No-op once finished.
    pub fn tick(&mut self) {
        if self.finished {
            return;
        }

        self.ticks += 1;
        if self.logic.on_tick(self.ticks, &self.members) == TickStatus::Finished {
            self.finished = true;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("capacity", &self.capacity)
            .field("finished", &self.finished)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn player(name: &str) -> PlayerId {
        PlayerId::parse(name).unwrap()
    }

    /// Finishes on a fixed tick and records moves.
    struct CountdownLogic {
        finish_at: u64,
        moves: Arc<Mutex<Vec<String>>>,
    }

    impl SessionLogic for CountdownLogic {
        fn on_move(&mut self, _player: &PlayerId, direction: &str) {
            self.moves.lock().unwrap().push(direction.to_string());
        }

        fn on_tick(&mut self, tick: u64, _members: &[PlayerId]) -> TickStatus {
            if tick >= self.finish_at {
                TickStatus::Finished
            } else {
                TickStatus::Continue
            }
        }
    }

    #[test]
    fn test_player_id_parse() {
        assert!(PlayerId::parse("alice").is_some());
        assert!(PlayerId::parse("").is_none());
        assert!(PlayerId::parse("a:b").is_none());
    }

    #[test]
    fn test_add_remove_member() {
        let mut session = Session::new(SessionId(0));
        let alice = player("alice");

        session.add_member(alice.clone()).unwrap();
        assert!(session.has_member(&alice));
        assert_eq!(session.member_count(), 1);

        assert!(session.remove_member(&alice));
        assert!(!session.has_member(&alice));
        assert!(!session.remove_member(&alice));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut session = Session::new(SessionId(3));
        session.add_member(player("alice")).unwrap();

        let result = session.add_member(player("alice"));
        assert!(matches!(result, Err(SessionError::AlreadyMember { .. })));
        assert_eq!(session.member_count(), 1);
    }

    #[test]
    fn test_session_full() {
        let mut session = Session::with_logic(SessionId(0), 2, Box::new(IdleLogic));
        session.add_member(player("a")).unwrap();
        assert!(!session.is_full());
        session.add_member(player("b")).unwrap();
        assert!(session.is_full());

        let result = session.add_member(player("c"));
        assert_eq!(result, Err(SessionError::Full(SessionId(0))));
        assert_eq!(session.member_count(), 2);
    }

    #[test]
    fn test_members_keep_join_order() {
        let mut session = Session::new(SessionId(0));
        for name in ["c", "a", "b"] {
            session.add_member(player(name)).unwrap();
        }
        session.remove_member(&player("a"));

        let names: Vec<&str> = session.members().iter().map(PlayerId::as_str).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_describe_state() {
        let mut session = Session::new(SessionId(7));
        assert_eq!(session.describe_state(), "Game 7 has 0 players");

        session.add_member(player("alice")).unwrap();
        assert_eq!(session.describe_state(), "Game 7 has 1 players");
    }

    #[test]
    fn test_idle_logic_never_finishes() {
        let mut session = Session::new(SessionId(0));
        for _ in 0..1000 {
            session.tick();
        }
        assert!(!session.is_finished());
        assert_eq!(session.ticks(), 1000);
    }

    #[test]
    fn test_tick_finishes_and_stays_finished() {
        let logic = CountdownLogic { finish_at: 3, moves: Arc::default() };
        let mut session = Session::with_logic(SessionId(0), 4, Box::new(logic));

        session.tick();
        session.tick();
        assert!(!session.is_finished());

        session.tick();
        assert!(session.is_finished());

        // Finished sessions stop counting.
        session.tick();
        assert_eq!(session.ticks(), 3);
        assert!(session.is_finished());
    }

    #[test]
    fn test_move_reaches_logic_without_finishing() {
        let moves = Arc::new(Mutex::new(Vec::new()));
        let logic = CountdownLogic { finish_at: 1, moves: moves.clone() };
        let mut session = Session::with_logic(SessionId(0), 4, Box::new(logic));
        let alice = player("alice");
        session.add_member(alice.clone()).unwrap();

        session.player_move(&alice, "left");
        assert!(!session.is_finished());
        assert_eq!(*moves.lock().unwrap(), vec!["left".to_string()]);

        // Only a tick can finish it.
        session.tick();
        assert!(session.is_finished());
    }
}
