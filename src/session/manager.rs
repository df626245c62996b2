use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Process-wide registry of live sessions, keyed by caller-chosen id.
///
/// The map is only mutated from the cooperative scheduler; `create` holds
/// the registry lock across the handshake, so concurrent creates are
/// serialized and id collisions cannot race.
pub struct SessionManager {
    cfg: ServerConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// Create a session and bring it to `Ready`.
    pub async fn create(
        &self,
        id: &str,
        kind: &str,
        source: &str,
    ) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }
        let session = Arc::new(Session::create(&self.cfg, id, kind, source).await?);
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Close a session and drop it from the registry.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.close().await
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    // Control wrappers, mirroring the dispatch surface an API layer needs.

    pub async fn pause(&self, id: &str) -> Result<(), SessionError> {
        self.resolve(id).await?.pause().await
    }

    pub async fn resume(&self, id: &str) -> Result<(), SessionError> {
        self.resolve(id).await?.resume().await
    }

    pub async fn set_speed(&self, id: &str, value: f32) -> Result<(), SessionError> {
        self.resolve(id).await?.set_speed(value).await
    }

    pub async fn seek(&self, id: &str, time: f32) -> Result<(), SessionError> {
        self.resolve(id).await?.seek(time).await
    }

    /// Close every session; used on server shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!("[SessionManager] close {} failed: {}", session.id(), e);
            }
        }
    }

    async fn resolve(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}
