//! Presence Signal Bridge
//!
//! Übersetzt Änderungen am eigenen Presence-Record in Coordinator-Commands
//! und schreibt das Incoming-Call Flag in den Record des Peers.
//! Pro beobachtetem Record existiert genau eine Subscription.

use super::record::{PeerSelection, RecordField};
use super::store::{PresenceError, PresenceStore};
use crate::session::CoordinatorHandle;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

// ============================================================================
// SIGNAL SINK
// ============================================================================

/// Ausgehende Seite: setzt das Incoming-Call Flag beim Peer
#[async_trait]
pub trait CallSignalSink: Send + Sync {
    async fn signal_peer(&self, peer_id: &str, active: bool) -> Result<(), PresenceError>;
}

/// Schreibt Flag und eigene User-ID in den Record des Peers
pub struct PresenceSignalSink {
    store: Arc<dyn PresenceStore>,
    local_user_id: String,
}

impl PresenceSignalSink {
    pub fn new(store: Arc<dyn PresenceStore>, local_user_id: impl Into<String>) -> Self {
        Self {
            store,
            local_user_id: local_user_id.into(),
        }
    }
}

#[async_trait]
impl CallSignalSink for PresenceSignalSink {
    async fn signal_peer(&self, peer_id: &str, active: bool) -> Result<(), PresenceError> {
        let field = RecordField::IncomingCall {
            requester_id: Some(self.local_user_id.clone()),
            value: active,
        };
        self.store.write_field(peer_id, field).await
    }
}

// ============================================================================
// BRIDGE
// ============================================================================

pub struct PresenceSignalBridge {
    store: Arc<dyn PresenceStore>,
    local_user_id: String,
    own_watch: Mutex<Option<JoinHandle<()>>>,
    peer_watch: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceSignalBridge {
    pub fn new(store: Arc<dyn PresenceStore>, local_user_id: impl Into<String>) -> Self {
        Self {
            store,
            local_user_id: local_user_id.into(),
            own_watch: Mutex::new(None),
            peer_watch: Mutex::new(None),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Sink, über den der Coordinator den Peer signalisiert
    pub fn signal_sink(&self) -> PresenceSignalSink {
        PresenceSignalSink::new(Arc::clone(&self.store), self.local_user_id.clone())
    }

    /// Beobachtet den eigenen Record und leitet Flag-Wechsel weiter
    ///
    /// Ein bereits gesetztes Flag beim Start zählt als eingehender Call.
    pub async fn start(&self, coordinator: CoordinatorHandle) -> Result<(), PresenceError> {
        let mut records = self.store.subscribe(&self.local_user_id).await?;
        let user_id = self.local_user_id.clone();

        let task = tokio::spawn(async move {
            let mut last_flag: Option<bool> = None;
            while let Some(record) = records.next().await {
                let signal = record.incoming_call_signal();
                let changed = match last_flag {
                    None => signal.flag_value,
                    Some(previous) => previous != signal.flag_value,
                };
                last_flag = Some(signal.flag_value);
                if !changed {
                    continue;
                }

                tracing::debug!(
                    "Incoming call flag for {} changed to {} (requester: {:?})",
                    user_id,
                    signal.flag_value,
                    signal.requester_id
                );
                if coordinator.incoming_signal(signal).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Presence watch for {} ended", user_id);
        });

        if let Some(previous) = self.own_watch.lock().replace(task) {
            previous.abort();
        }
        tracing::info!("Watching presence record of {}", self.local_user_id);
        Ok(())
    }

    /// Wählt einen Peer aus und hält dessen Profil aktuell
    ///
    /// Eine vorherige Peer-Subscription wird zuerst beendet.
    pub async fn watch_peer(
        &self,
        selection: PeerSelection,
        coordinator: CoordinatorHandle,
    ) -> Result<(), PresenceError> {
        if let Some(previous) = self.peer_watch.lock().take() {
            previous.abort();
        }

        if let Err(e) = coordinator.select_peer(selection.clone()).await {
            tracing::warn!("Failed to select peer {}: {}", selection.peer_id, e);
        }

        let mut records = self.store.subscribe(&selection.peer_id).await?;
        let peer_id = selection.peer_id.clone();

        let task = tokio::spawn(async move {
            let mut current = selection;
            while let Some(record) = records.next().await {
                let updated = PeerSelection::from_record(&record);
                if updated == current {
                    continue;
                }
                tracing::debug!("Peer {} updated", updated.peer_id);
                current = updated.clone();
                if coordinator.select_peer(updated).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.peer_watch.lock().replace(task) {
            previous.abort();
        }
        tracing::info!("Watching presence record of peer {}", peer_id);
        Ok(())
    }

    /// Beendet alle Subscriptions
    pub fn stop(&self) {
        for watch in [&self.own_watch, &self.peer_watch] {
            if let Some(task) = watch.lock().take() {
                task.abort();
            }
        }
    }
}

impl Drop for PresenceSignalBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PresenceSignalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSignalBridge")
            .field("local_user_id", &self.local_user_id)
            .field("watching_peer", &self.peer_watch.lock().is_some())
            .finish()
    }
}
