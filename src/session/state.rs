//! Call-Session Zustand
//!
//! Der Zustand gehört exklusiv dem Coordinator-Task. Alle anderen
//! Komponenten sehen nur den `SessionSnapshot` über einen `watch` Kanal.

use crate::media::PublicationHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// STATES
// ============================================================================

/// Verbindungsstatus zum Relay-Room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// Publish-Unterzustand, nur gültig während `Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PublishState {
    #[default]
    NotPublished,
    Publishing,
    Published,
    Unpublishing,
}

/// Lebenszyklus-Phase der App
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenePhase {
    #[default]
    Active,
    Inactive,
    Background,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("Publish state {publish:?} requires a connected session, found {connection:?}")]
    PublishWithoutConnection {
        connection: ConnectionState,
        publish: PublishState,
    },

    #[error("Media handle present while not published")]
    DanglingMediaHandle,
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CallSession {
    pub connection_state: ConnectionState,
    pub publish_state: PublishState,
    pub peer_id: Option<String>,
    pub media_handle: Option<PublicationHandle>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Prüft die Invarianten nach jedem Übergang
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.publish_state != PublishState::NotPublished
            && self.connection_state != ConnectionState::Connected
        {
            return Err(InvariantViolation::PublishWithoutConnection {
                connection: self.connection_state,
                publish: self.publish_state,
            });
        }
        if self.media_handle.is_some() && self.publish_state == PublishState::NotPublished {
            return Err(InvariantViolation::DanglingMediaHandle);
        }
        Ok(())
    }

    /// Zurück auf `Idle`
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_connected_to(&self, peer_id: &str) -> bool {
        self.connection_state == ConnectionState::Connected
            && self.peer_id.as_deref() == Some(peer_id)
    }

    pub fn has_active_track(&self) -> bool {
        self.publish_state == PublishState::Published
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.connection_state,
            publish_state: self.publish_state,
            peer_id: self.peer_id.clone(),
            has_active_track: self.has_active_track(),
            connected_at: self.connected_at,
            updated_at: Utc::now(),
        }
    }
}

/// Lesbare Kopie des Zustands für UI, Audio-Controller und Tests
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub publish_state: PublishState,
    pub peer_id: Option<String>,
    pub has_active_track: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        CallSession::default().snapshot()
    }
}

impl SessionSnapshot {
    pub fn is_idle(&self) -> bool {
        self.connection_state == ConnectionState::Idle
    }
}

/// Erstellt den Snapshot-Kanal mit einem leeren Session-Zustand
pub fn snapshot_channel() -> (watch::Sender<SessionSnapshot>, watch::Receiver<SessionSnapshot>) {
    watch::channel(SessionSnapshot::default())
}

// ============================================================================
// TESTS
// ============================================================================
