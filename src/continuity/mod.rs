//! Continuity Module - Hintergrund-Ausführung während eines Calls
//!
//! Dieses Modul verwaltet:
//! - Background-Leases pro Rolle (Call, Keep-Alive Audio)
//! - Die Keep-Alive Schleife mit periodischer Lease-Erneuerung
//! - Stilles Keep-Alive Audio (optional über cpal)

#[cfg(feature = "device-audio")]
mod device;
mod lease;
mod player;

#[cfg(feature = "device-audio")]
pub use device::{AudioError, DeviceSilencePlayer};
pub use lease::{
    BackgroundLeaseApi, ContinuityLease, ContinuityLeaseManager, ExpirationHandler, LeaseHandle,
    LeaseRole,
};
pub use player::{KeepAlivePlayer, NoopKeepAlivePlayer};
