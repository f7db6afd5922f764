//! Keep-Alive Wiedergabe
//!
//! Stilles, endlos geloopt abgespieltes Audio hält die App im Hintergrund
//! am Leben solange der Lease erneuert wird.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait KeepAlivePlayer: Send + Sync {
    fn play(&self);
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

/// Player ohne Ausgabegerät; merkt sich nur den Zustand
///
/// Für Plattformen, deren Background-Lease kein Audio benötigt.
#[derive(Debug, Default)]
pub struct NoopKeepAlivePlayer {
    playing: AtomicBool,
}

impl NoopKeepAlivePlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeepAlivePlayer for NoopKeepAlivePlayer {
    fn play(&self) {
        self.playing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}
