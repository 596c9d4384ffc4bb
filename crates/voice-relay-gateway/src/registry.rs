//! Connection id -> session task mapping.
//!
//! The registry owns no session state. Each entry is the inbox sender and
//! cancellation token of the task that does.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use voice_relay_core::protocol::ClientEvent;

/// Receiving end of a session's client event channel.
pub type SessionInbox = mpsc::UnboundedReceiver<ClientEvent>;

/// Cheap handle to a live session task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Token fired when the session is closed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for `id`, or return the existing one.
    ///
    /// The inbox is `Some` only when the entry was created by this call; the
    /// caller then owns it and must hand it to the session task.
    pub async fn open(&self, id: &str) -> (SessionHandle, Option<SessionInbox>) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            return (existing.clone(), None);
        }
        let (events, inbox) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            id: id.to_string(),
            events,
            cancel: CancellationToken::new(),
        };
        sessions.insert(id.to_string(), handle.clone());
        debug!(session_id = id, "Session registered");
        (handle, Some(inbox))
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove the entry and cancel its task. Unknown ids are ignored.
    pub async fn close(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(handle) = removed {
            handle.cancel.cancel();
            debug!(session_id = id, "Session closed");
        }
    }

    /// Deliver a client event. Returns false when no live session has `id`.
    pub async fn forward(&self, id: &str, event: ClientEvent) -> bool {
        match self.sessions.read().await.get(id) {
            Some(handle) => handle.events.send(event).is_ok(),
            None => false,
        }
    }

    /// Snapshot of the live session ids, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancel every session (server shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.cancel.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closed all sessions");
        }
    }
}
