//! Client Connection
//!
//! Holds the session id handed out by the registry node and keeps it alive
//! with heartbeats. When the server no longer knows the session the client
//! reconnects; a session id different from the previous one means nothing of
//! ours is registered on the server any more, so the redo registry is reset
//! before the new session is published.

use super::error::ClientError;
use super::redo::RedoRegistry;
use super::rpc::NamingRpc;

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct ClientConnection {
    rpc: Arc<dyn NamingRpc>,
    registry: Arc<RedoRegistry>,
    namespace: String,
    heartbeat_interval: Duration,
    session: RwLock<Option<String>>,
    /// Last session id ever received, kept across disconnects.
    last_session: Mutex<Option<String>>,
    connecting: tokio::sync::Mutex<()>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    pub fn new(
        rpc: Arc<dyn NamingRpc>,
        registry: Arc<RedoRegistry>,
        namespace: &str,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            registry,
            namespace: namespace.to_string(),
            heartbeat_interval,
            session: RwLock::new(None),
            last_session: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session_id().is_some()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mark_disconnected(&self) {
        let previous = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = previous {
            tracing::warn!("Lost session {}", id);
        }
    }

    /// Opens a new session. Must not be called while holding a redo entry
    /// lock: a changed session id resets every entry.
    pub async fn connect(&self) -> Result<String, ClientError> {
        let _connecting = self.connecting.lock().await;

        let session_id = self.rpc.connect(&self.namespace).await?;
        let previous = self
            .last_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session_id.clone());

        if previous.as_deref() != Some(session_id.as_str()) {
            self.registry.on_new_session().await;
        }
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session_id.clone());

        tracing::info!("Connected with session {}", session_id);
        Ok(session_id)
    }

    /// One heartbeat round: beat on the current session, reconnect when
    /// there is none or the server dropped it. Returns whether the client
    /// ends up connected.
    pub async fn heartbeat_once(&self) -> bool {
        if let Some(session_id) = self.session_id() {
            match self.rpc.heartbeat(&session_id).await {
                Ok(()) => return true,
                Err(e) if e.is_session_lost() => {
                    tracing::warn!("Session {} rejected by server: {}", session_id, e);
                    self.mark_disconnected();
                }
                Err(e) => {
                    // The server may still hold the session; beat again next round.
                    tracing::warn!("Heartbeat failed: {}", e);
                    return true;
                }
            }
        }

        match self.connect().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Reconnect failed: {}", e);
                false
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if heartbeat.is_some() {
            return;
        }

        let connection = self.clone();
        *heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(connection.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                connection.heartbeat_once().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
