use super::state::SessionSnapshot;
use crate::presence::PeerSelection;

/// Events die vom Coordinator ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(SessionSnapshot),
    ConnectionFailed { peer_id: String, reason: String },
    PublishFailed { reason: String },
    UnpublishFailed { reason: String },
    DisconnectFailed { reason: String },
    /// Relay versucht die Verbindung wiederherzustellen
    Reconnecting,
    /// Relay hat die Verbindung unerwartet verloren
    ConnectionLost { peer_id: Option<String> },
    PeerUpdated(PeerSelection),
}

impl CallEvent {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::PublishFailed { .. }
                | Self::UnpublishFailed { .. }
                | Self::DisconnectFailed { .. }
                | Self::ConnectionLost { .. }
        )
    }
}
