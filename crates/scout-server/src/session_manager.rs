//! Server-held sessions and the turn concurrency limit.
//!
//! Sessions live in a map keyed by id. Generating a turn additionally needs
//! a [`TurnGuard`], so at most `max_concurrent` turns are in flight across
//! all sessions; the guard is released when the turn's response (or SSE
//! stream) is dropped, including on client disconnect.

use std::collections::HashMap;
use std::sync::Arc;

use scout_agents::{Session, SharedSession};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use uuid::Uuid;

use crate::error::ServerError;

pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, SharedSession>>,
    turn_limit: Arc<Semaphore>,
    max_concurrent: usize,
    max_sessions: usize,
}

/// A slot in the turn limit. Dropping it frees the slot.
pub struct TurnGuard {
    session_id: Option<Uuid>,
    _permit: OwnedSemaphorePermit,
}

impl TurnGuard {
    /// The server-held session this turn belongs to, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        debug!(session_id = ?self.session_id, "turn slot released");
    }
}

impl SessionManager {
    pub fn new(max_concurrent: usize, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            turn_limit: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_sessions,
        })
    }

    /// Register a session. Fails when the server already holds `max_sessions`.
    pub async fn insert(&self, session: Session) -> Result<Uuid, ServerError> {
        let id = session.id();
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            return Err(ServerError::ServiceUnavailable);
        }
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<SharedSession, ServerError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or(ServerError::SessionNotFound(id))
    }

    /// Forget a session. A turn already running on it finishes on its own.
    pub async fn remove(&self, id: Uuid) -> Result<SharedSession, ServerError> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).ok_or(ServerError::SessionNotFound(id))
    }

    /// Take a turn slot without waiting.
    pub fn try_acquire_turn(&self, session_id: Option<Uuid>) -> Result<TurnGuard, ServerError> {
        let permit = self
            .turn_limit
            .clone()
            .try_acquire_owned()
            .map_err(|_| ServerError::ServiceUnavailable)?;
        Ok(TurnGuard {
            session_id,
            _permit: permit,
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Free turn slots.
    pub fn available_permits(&self) -> usize {
        self.turn_limit.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_runtime::Model;
    use scout_tokenizer::ChatTemplate;

    fn session() -> Session {
        Session::new(Model::scripted(&["ok"], 128).unwrap(), ChatTemplate::chatml())
    }

    #[tokio::test]
    async fn turn_slots_are_released_on_drop() {
        let manager = SessionManager::new(1, 4);
        let guard = manager.try_acquire_turn(None).unwrap();
        assert_eq!(manager.available_permits(), 0);
        assert!(matches!(
            manager.try_acquire_turn(None),
            Err(ServerError::ServiceUnavailable)
        ));
        drop(guard);
        assert_eq!(manager.available_permits(), 1);
    }

    #[tokio::test]
    async fn session_limit_and_lookup() {
        let manager = SessionManager::new(1, 1);
        let id = manager.insert(session()).await.unwrap();
        assert!(manager.get(id).await.is_ok());
        assert!(matches!(
            manager.insert(session()).await,
            Err(ServerError::ServiceUnavailable)
        ));

        manager.remove(id).await.unwrap();
        assert!(matches!(
            manager.get(id).await,
            Err(ServerError::SessionNotFound(_))
        ));
        assert_eq!(manager.session_count().await, 0);
    }
}
