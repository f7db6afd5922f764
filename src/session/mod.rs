//! Session Module - Lebenszyklus eines Calls
//!
//! Dieses Modul verwaltet:
//! - Den Call-Zustand (Verbindung, Publish, Peer)
//! - Den Coordinator-Task, der alle Übergänge serialisiert
//! - Events und Snapshots für UI und Audio-Controller

mod coordinator;
mod events;
mod state;

pub use coordinator::{
    CallSessionCoordinator, CoordinatorDeps, CoordinatorError, CoordinatorHandle,
    CoordinatorSettings, OperationError,
};
pub use events::CallEvent;
pub use state::{
    snapshot_channel, CallSession, ConnectionState, InvariantViolation, PublishState, ScenePhase,
    SessionSnapshot,
};
