//! Presence Module - Signalisierung über Benutzer-Records
//!
//! Dieses Modul verwaltet:
//! - Das Record-Modell (Profil, Freunde, Incoming-Call Flag)
//! - Die Store-Schnittstelle und einen In-Memory Store
//! - Die Bridge zwischen Store und Coordinator

mod bridge;
mod memory;
mod record;
mod store;

pub use bridge::{CallSignalSink, PresenceSignalBridge, PresenceSignalSink};
pub use memory::MemoryPresenceStore;
pub use record::{
    generate_pin, IncomingCallSignal, PeerProfile, PeerSelection, PresenceRecord, RecordField,
    PIN_LENGTH,
};
pub use store::{PresenceError, PresenceStore, RecordStream};
