//! Presence-Store Schnittstelle

use super::record::{PresenceRecord, RecordField};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Presence record not found: {0}")]
    RecordNotFound(String),

    #[error("Presence store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid presence record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

/// Strom von Record-Ständen; Droppen beendet die Subscription
pub type RecordStream = BoxStream<'static, PresenceRecord>;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn fetch(&self, record_id: &str) -> Result<PresenceRecord, PresenceError>;

    /// Liefert zuerst den aktuellen Stand, danach jede Änderung
    async fn subscribe(&self, record_id: &str) -> Result<RecordStream, PresenceError>;

    async fn write_field(&self, record_id: &str, field: RecordField) -> Result<(), PresenceError>;
}
