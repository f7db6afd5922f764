//! Media-Relay Schnittstelle
//!
//! Der Relay-Dienst (LiveKit Room) ist eine Black Box. Der Coordinator
//! kennt nur connect/disconnect/publish/unpublish und den Verbindungsstatus.

use super::token::RoomCredential;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use url::Url;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Failed to connect to room: {0}")]
    ConnectFailed(String),

    #[error("Failed to disconnect from room: {0}")]
    DisconnectFailed(String),

    #[error("Failed to publish track: {0}")]
    PublishFailed(String),

    #[error("Failed to unpublish track: {0}")]
    UnpublishFailed(String),

    #[error("Not connected to a room")]
    NotConnected,
}

// ============================================================================
// TYPES
// ============================================================================

/// Verbindungsstatus wie ihn der Relay-Dienst meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Lokaler Mikrofon-Track, der veröffentlicht werden soll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAudioTrack {
    pub id: Uuid,
    pub name: String,
}

impl LocalAudioTrack {
    pub fn microphone() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "microphone".to_string(),
        }
    }
}

/// Handle einer veröffentlichten Publication (gehört exklusiv dem Coordinator)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicationHandle {
    pub sid: String,
    pub track_id: Uuid,
}

// ============================================================================
// RELAY TRAIT
// ============================================================================

#[async_trait]
pub trait MediaRelay: Send + Sync {
    /// Betritt den Room mit einem kurzlebigen Credential
    async fn connect(&self, server_url: &Url, credential: &RoomCredential)
        -> Result<(), RelayError>;

    /// Verlässt den Room
    async fn disconnect(&self) -> Result<(), RelayError>;

    async fn publish(&self, track: LocalAudioTrack) -> Result<PublicationHandle, RelayError>;

    async fn unpublish(&self, publication: &PublicationHandle) -> Result<(), RelayError>;

    /// Receiver für Statusänderungen der Relay-Verbindung
    fn subscribe_state(&self) -> broadcast::Receiver<RelayConnectionState>;
}
