//! Session Directory
//!
//! Owns every live session and the player → session reverse index.
//! Membership changes and index updates happen inside the same `&mut self`
//! call, so the two never disagree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::game::session::{IdleLogic, PlayerId, Session, SessionError, SessionId, SessionLogic};
use crate::SESSION_CAPACITY;

/// Directory shared between connections and the tick scheduler.
pub type SharedDirectory = Arc<Mutex<SessionDirectory>>;

/// Builds the game logic for each new session.
pub type LogicFactory = Arc<dyn Fn(SessionId) -> Box<dyn SessionLogic> + Send + Sync>;

/// Directory errors reported back to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Player is not a member of any session.
    #[error("player is not in a game")]
    NotInGame,

    /// Player already belongs to a session.
    #[error("player is already in a game")]
    AlreadyInGame(SessionId),

    /// Session id that is not live.
    #[error("game {0} does not exist")]
    UnknownSession(SessionId),

    /// Session rejected the membership change.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Joined player, as listed by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerEntry {
    /// Player identity.
    pub id: String,
    /// Display name (the identity; clients have no separate name yet).
    pub name: String,
    /// Session the player belongs to.
    pub session: SessionId,
}

/// Registry of live sessions.
pub struct SessionDirectory {
    /// Sessions keyed by id. Ids are sequential, so key order is creation order.
    sessions: BTreeMap<SessionId, Session>,
    /// Player to session mapping.
    player_sessions: HashMap<PlayerId, SessionId>,
    next_id: SessionId,
    capacity: usize,
    logic_factory: LogicFactory,
}

impl SessionDirectory {
    /// Create an empty directory with the default capacity and idle logic.
    pub fn new() -> Self {
        Self::with_logic(
            SESSION_CAPACITY,
            Arc::new(|_: SessionId| -> Box<dyn SessionLogic> { Box::new(IdleLogic) }),
        )
    }

    /// Create an empty directory with an explicit capacity and logic factory.
    pub fn with_logic(capacity: usize, logic_factory: LogicFactory) -> Self {
        Self {
            sessions: BTreeMap::new(),
            player_sessions: HashMap::new(),
            next_id: SessionId::default(),
            capacity,
            logic_factory,
        }
    }

    /// Wrap into the shared form used by the server.
    pub fn into_shared(self) -> SharedDirectory {
        Arc::new(Mutex::new(self))
    }

    /// Per-session capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// First session (by creation order) with room for another player,
    /// creating one if none has room.
    pub fn find_or_create_joinable(&mut self) -> SessionId {
        let joinable = self
            .sessions
            .values()
            .find(|s| !s.is_full() && !s.is_finished())
            .map(Session::id);

        if let Some(id) = joinable {
            return id;
        }

        let id = self.next_id;
        self.next_id = id.next();
        let session = Session::with_logic(id, self.capacity, (self.logic_factory)(id));
        self.sessions.insert(id, session);
        id
    }

    /// Session containing a player.
    pub fn find_by_member(&self, player: &PlayerId) -> Option<&Session> {
        let id = self.player_sessions.get(player)?;
        self.sessions.get(id)
    }

    /// Session by id.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Remove a session, dropping any index entries that still point at it.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;

        let before = self.player_sessions.len();
        self.player_sessions.retain(|_, session_id| *session_id != id);
        let purged = before - self.player_sessions.len();
        if purged > 0 {
            warn!("Game {} removed with {} players still attached", id, purged);
        }

        Some(session)
    }

    /// Put a player into the first joinable session.
    pub fn join(&mut self, player: PlayerId) -> Result<SessionId, DirectoryError> {
        if let Some(existing) = self.player_sessions.get(&player) {
            return Err(DirectoryError::AlreadyInGame(*existing));
        }

        let id = self.find_or_create_joinable();
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(DirectoryError::UnknownSession(id))?;
        session.add_member(player.clone())?;

        // Indexed only once the session holds the player.
        self.player_sessions.insert(player, id);
        Ok(id)
    }

    /// Forward a move to the player's session.
    pub fn player_move(&mut self, player: &PlayerId, direction: &str) -> Result<SessionId, DirectoryError> {
        let session = self.member_session_mut(player)?;
        session.player_move(player, direction);
        Ok(session.id())
    }

    /// Take a player out of their session.
    pub fn leave(&mut self, player: &PlayerId) -> Result<SessionId, DirectoryError> {
        let id = self
            .player_sessions
            .remove(player)
            .ok_or(DirectoryError::NotInGame)?;

        if let Some(session) = self.sessions.get_mut(&id) {
            session.remove_member(player);
        }
        Ok(id)
    }

    /// Describe the player's session.
    pub fn state(&self, player: &PlayerId) -> Result<String, DirectoryError> {
        self.find_by_member(player)
            .map(Session::describe_state)
            .ok_or(DirectoryError::NotInGame)
    }

    /// Tick every session once. Returns the ids that are finished afterwards.
    ///
    /// Nothing is removed here; the caller reaps after the pass completes.
    pub fn tick_all(&mut self) -> Vec<SessionId> {
        let mut finished = Vec::new();
        for session in self.sessions.values_mut() {
            session.tick();
            if session.is_finished() {
                finished.push(session.id());
            }
        }
        finished
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of joined players.
    pub fn player_count(&self) -> usize {
        self.player_sessions.len()
    }

    /// Joined players, by session then join order.
    pub fn players(&self) -> Vec<PlayerEntry> {
        self.sessions
            .values()
            .flat_map(|session| {
                session.members().iter().map(move |player| PlayerEntry {
                    id: player.to_string(),
                    name: player.to_string(),
                    session: session.id(),
                })
            })
            .collect()
    }

    fn member_session_mut(&mut self, player: &PlayerId) -> Result<&mut Session, DirectoryError> {
        let id = self.player_sessions.get(player).ok_or(DirectoryError::NotInGame)?;
        match self.sessions.get_mut(id) {
            Some(session) => Ok(session),
            None => {
                debug!("Index for {} points at missing game {}", player, id);
                Err(DirectoryError::NotInGame)
            }
        }
    }
}

impl Default for SessionDirectory {
    fn default() -> Self {
        Self::new()
    }
}
