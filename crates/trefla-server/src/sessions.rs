//! Registry of live real-time sessions.
//!
//! Every connected WebSocket gets a session id and a bounded outbound queue.
//! Producers never wait on a slow or vanished client: a full or closed queue
//! drops the event.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use trefla_shared::protocol::RealtimeEvent;
use trefla_shared::types::UserId;

struct Session {
    user_id: UserId,
    tx: mpsc::Sender<RealtimeEvent>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Open a session for `user_id`.  Returns the session id and the queue
    /// the connection task drains.
    pub async fn register(&self, user_id: UserId) -> (Uuid, mpsc::Receiver<RealtimeEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, Session { user_id, tx });

        info!(
            session = %session_id,
            user = %user_id,
            sessions = sessions.len(),
            "Session registered"
        );
        (session_id, rx)
    }

    pub async fn unregister(&self, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(&session_id) {
            info!(
                session = %session_id,
                user = %session.user_id,
                sessions = sessions.len(),
                "Session closed"
            );
        }
    }

    pub async fn is_connected(&self, session_id: Uuid) -> bool {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .is_some_and(|s| !s.tx.is_closed())
    }

    /// Queue `event` for one session.  Returns `false` if it was dropped.
    pub async fn emit_to_session(&self, session_id: Uuid, event: RealtimeEvent) -> bool {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(&session_id) else {
            debug!(session = %session_id, event = event.name(), "No such session, dropping event");
            return false;
        };

        let name = event.name();
        if session.tx.try_send(event).is_err() {
            debug!(
                session = %session_id,
                user = %session.user_id,
                event = name,
                "Dropping event for slow or closed session"
            );
            return false;
        }
        true
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
