//! Client sessions of the TCP gateway.

use crate::network::messages::Response;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// One connected client.
///
/// Owned by the gateway; tasks keep only a `Weak` so a disconnected client
/// never holds a task back.
#[derive(Debug)]
pub struct ClientSession {
    /// Random session id.
    pub id: String,
    /// Remote address, `None` for in-process callers.
    pub peer: Option<SocketAddr>,
    /// When the client connected.
    pub created_at: DateTime<Utc>,
    last_activity: AtomicI64,
    outbound: Option<mpsc::UnboundedSender<Response>>,
}

impl ClientSession {
    /// Session that pushes responses into `outbound`, if given.
    pub fn new(peer: Option<SocketAddr>, outbound: Option<mpsc::UnboundedSender<Response>>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            outbound,
        }
    }

    /// Session with nowhere to push results (in-process callers).
    pub fn detached() -> Self {
        Self::new(None, None)
    }

    /// Queue `response` for the client's writer. False if the client is gone
    /// or the session has no outbound channel.
    pub fn send(&self, response: Response) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Record client activity.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last request.
    pub fn idle_for(&self) -> chrono::Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        chrono::Duration::milliseconds(Utc::now().timestamp_millis() - last)
    }
}

/// Live sessions by id.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<ClientSession>>>>,
}

impl SessionManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a newly connected client.
    pub async fn create_session(
        &self,
        peer: Option<SocketAddr>,
        outbound: Option<mpsc::UnboundedSender<Response>>,
    ) -> Arc<ClientSession> {
        let session = Arc::new(ClientSession::new(peer, outbound));
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Forget a session. True if it was registered.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Number of connected clients.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True when no client is connected.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
