//! In-Memory Presence-Store
//!
//! Für lokale Läufe und Tests. Mehrere Clients können denselben Store
//! teilen und sehen dann gegenseitig ihre Schreibzugriffe.

use super::record::{PresenceRecord, RecordField};
use super::store::{PresenceError, PresenceStore, RecordStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const UPDATE_CHANNEL_CAPACITY: usize = 32;

struct Entry {
    record: PresenceRecord,
    updates: broadcast::Sender<PresenceRecord>,
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    records: Mutex<HashMap<String, Entry>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legt einen Record an oder ersetzt ihn komplett
    pub fn insert(&self, record: PresenceRecord) {
        let mut records = self.records.lock();
        match records.get_mut(&record.id) {
            Some(entry) => {
                entry.record = record.clone();
                let _ = entry.updates.send(record);
            }
            None => {
                let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
                records.insert(record.id.clone(), Entry { record, updates });
            }
        }
    }

    pub fn get(&self, record_id: &str) -> Option<PresenceRecord> {
        self.records
            .lock()
            .get(record_id)
            .map(|entry| entry.record.clone())
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn fetch(&self, record_id: &str) -> Result<PresenceRecord, PresenceError> {
        self.get(record_id)
            .ok_or_else(|| PresenceError::RecordNotFound(record_id.to_string()))
    }

    async fn subscribe(&self, record_id: &str) -> Result<RecordStream, PresenceError> {
        let (current, updates) = {
            let records = self.records.lock();
            let entry = records
                .get(record_id)
                .ok_or_else(|| PresenceError::RecordNotFound(record_id.to_string()))?;
            (entry.record.clone(), entry.updates.subscribe())
        };

        let changes = stream::unfold(updates, |mut updates| async move {
            loop {
                match updates.recv().await {
                    Ok(record) => return Some((record, updates)),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Presence subscription skipped {} updates", n);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::once(async move { current }).chain(changes).boxed())
    }

    async fn write_field(&self, record_id: &str, field: RecordField) -> Result<(), PresenceError> {
        let mut records = self.records.lock();
        let entry = records
            .get_mut(record_id)
            .ok_or_else(|| PresenceError::RecordNotFound(record_id.to_string()))?;

        entry.record.apply(&field);
        let _ = entry.updates.send(entry.record.clone());
        Ok(())
    }
}
