//! Audio Route Controller
//!
//! Reagiert auf Hardware-Routenwechsel (Kopfhörer, Bluetooth, Kategorie)
//! und schreibt die Audio-Session Konfiguration passend zum aktuellen
//! Track-Status um.
//!
//! Alle Schreibzugriffe auf die Audio-Session laufen über eine eigene Queue
//! (ein Task, eine Operation zur Zeit). Die Hardware-Aufrufe blockieren und
//! laufen daher in `spawn_blocking`, der Coordinator wird nie aufgehalten.

use crate::session::SessionSnapshot;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioSessionError {
    #[error("Failed to set audio category: {0}")]
    Category(String),

    #[error("Failed to set audio mode: {0}")]
    Mode(String),

    #[error("Failed to set audio session active={active}: {reason}")]
    Activation { active: bool, reason: String },
}

// ============================================================================
// AUDIO SESSION TYPES
// ============================================================================

/// Grund eines Routenwechsels wie ihn das Betriebssystem meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    NewDeviceAvailable,
    OldDeviceUnavailable,
    CategoryChange,
    RouteConfigurationChange,
    Other,
}

impl RouteChangeReason {
    /// Mappt die rohen Reason-Codes der Plattform (AVAudioSession Numerierung)
    pub fn from_raw(value: u32) -> Self {
        match value {
            1 => Self::NewDeviceAvailable,
            2 => Self::OldDeviceUnavailable,
            3 => Self::CategoryChange,
            8 => Self::RouteConfigurationChange,
            _ => Self::Other,
        }
    }

    fn requires_reconfiguration(self) -> bool {
        matches!(
            self,
            Self::NewDeviceAvailable | Self::OldDeviceUnavailable | Self::CategoryChange
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCategory {
    Ambient,
    SoloAmbient,
    Playback,
    Record,
    PlayAndRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Default,
    VoiceChat,
    VideoChat,
    Measurement,
}

impl AudioMode {
    /// Voice-Chat Modus blockiert bei Routenwechseln den Lautsprecher
    pub fn is_call_like(self) -> bool {
        self == Self::VoiceChat
    }
}

/// Category-Options als Bitmenge
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CategoryOptions(u8);

impl CategoryOptions {
    pub const NONE: Self = Self(0);
    pub const MIX_WITH_OTHERS: Self = Self(1 << 0);
    pub const DUCK_OTHERS: Self = Self(1 << 1);
    pub const ALLOW_BLUETOOTH: Self = Self(1 << 2);
    pub const DEFAULT_TO_SPEAKER: Self = Self(1 << 3);
    pub const ALLOW_BLUETOOTH_A2DP: Self = Self(1 << 4);
    pub const ALLOW_AIRPLAY: Self = Self(1 << 5);

    const NAMES: [(Self, &'static str); 6] = [
        (Self::MIX_WITH_OTHERS, "mixWithOthers"),
        (Self::DUCK_OTHERS, "duckOthers"),
        (Self::ALLOW_BLUETOOTH, "allowBluetooth"),
        (Self::DEFAULT_TO_SPEAKER, "defaultToSpeaker"),
        (Self::ALLOW_BLUETOOTH_A2DP, "allowBluetoothA2DP"),
        (Self::ALLOW_AIRPLAY, "allowAirPlay"),
    ];

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CategoryOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CategoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(option, _)| self.contains(*option))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

impl fmt::Debug for CategoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

/// Komplette Konfiguration der Audio-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSessionConfig {
    pub category: AudioCategory,
    pub mode: AudioMode,
    pub options: CategoryOptions,
}

impl AudioSessionConfig {
    /// Standard-Konfiguration für einen laufenden Call
    pub fn call_default() -> Self {
        Self {
            category: AudioCategory::PlayAndRecord,
            mode: AudioMode::VoiceChat,
            options: CategoryOptions::ALLOW_BLUETOOTH,
        }
    }

    /// Konfiguration zum Aufnehmen vor dem Publish (Lautsprecher als Default)
    pub fn capture() -> Self {
        Self {
            category: AudioCategory::PlayAndRecord,
            mode: AudioMode::Default,
            options: CategoryOptions::DEFAULT_TO_SPEAKER,
        }
    }
}

impl fmt::Display for AudioSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category: {:?}, mode: {:?}, options: [{}]",
            self.category, self.mode, self.options
        )
    }
}

/// Momentaufnahme bei einem Routenwechsel, Eingabe für die Umschreibung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRouteSnapshot {
    pub reason: RouteChangeReason,
    pub current: AudioSessionConfig,
    pub has_active_track: bool,
}

impl AudioRouteSnapshot {
    /// Zielkonfiguration oder `None` wenn nichts zu tun ist
    pub fn target(&self) -> Option<AudioSessionConfig> {
        if !self.reason.requires_reconfiguration() || !self.current.mode.is_call_like() {
            return None;
        }

        let target = if self.has_active_track {
            AudioSessionConfig {
                category: AudioCategory::PlayAndRecord,
                mode: AudioMode::VideoChat,
                options: self.current.options
                    | CategoryOptions::DEFAULT_TO_SPEAKER
                    | CategoryOptions::ALLOW_BLUETOOTH,
            }
        } else {
            AudioSessionConfig {
                mode: AudioMode::VideoChat,
                ..self.current
            }
        };
        Some(target)
    }
}

// ============================================================================
// AUDIO SESSION TRAIT
// ============================================================================

/// Plattform-Audio-Session (blockierende Hardware-Aufrufe)
pub trait AudioSession: Send + Sync + 'static {
    fn current(&self) -> AudioSessionConfig;

    /// Setzt die Konfiguration, optional mit (De-)Aktivierung
    fn apply(
        &self,
        config: &AudioSessionConfig,
        active: Option<bool>,
    ) -> Result<(), AudioSessionError>;

    fn set_active(&self, active: bool) -> Result<(), AudioSessionError>;
}

// ============================================================================
// HANDLERS
// ============================================================================

fn handle_route_change(session: &dyn AudioSession, reason: RouteChangeReason, has_active_track: bool) {
    let snapshot = AudioRouteSnapshot {
        reason,
        current: session.current(),
        has_active_track,
    };

    let Some(target) = snapshot.target() else {
        match reason {
            RouteChangeReason::RouteConfigurationChange => {
                tracing::info!("Route change - configuration change");
            }
            _ if reason.requires_reconfiguration() => {
                tracing::info!(
                    "Route change ({:?}) not handled in mode {:?}",
                    reason,
                    snapshot.current.mode
                );
            }
            _ => {}
        }
        return;
    };

    match session.apply(&target, None) {
        Ok(()) => tracing::info!(
            "Route change ({:?}): switched mode {:?} -> {:?}, configured {}",
            reason,
            snapshot.current.mode,
            target.mode,
            target
        ),
        Err(e) => tracing::warn!("Failed to reconfigure audio session on route change: {}", e),
    }
}

fn handle_track_transition(session: &dyn AudioSession, had_track: bool, has_track: bool) {
    let set_active = match (had_track, has_track) {
        (false, true) => true,
        (true, false) => false,
        _ => return,
    };

    let config = AudioSessionConfig::call_default();
    tracing::info!(
        "Configuring audio session {}, setActive: {}",
        config,
        set_active
    );

    match session.apply(&config, Some(set_active)) {
        Ok(()) => tracing::info!(
            "Succeeded to {} audio session",
            if set_active { "activate" } else { "deactivate" }
        ),
        Err(e) => tracing::warn!("Failed to configure audio session: {}", e),
    }
}

fn prepare_capture(session: &dyn AudioSession) {
    let result = session
        .set_active(false)
        .and_then(|_| session.apply(&AudioSessionConfig::capture(), Some(true)));

    if let Err(e) = result {
        tracing::warn!("Failed to set up audio session before publishing: {}", e);
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

enum RouteTask {
    RouteChanged(RouteChangeReason),
    TrackTransition { had_track: bool, has_track: bool },
    PrepareCapture(oneshot::Sender<()>),
}

/// Handle auf die Queue des Controllers
#[derive(Debug, Clone)]
pub struct RouteControllerHandle {
    tx: mpsc::UnboundedSender<RouteTask>,
}

impl RouteControllerHandle {
    /// Vom OS-Callback aufgerufen, blockiert nie
    pub fn on_route_change(&self, reason: RouteChangeReason) {
        if self.tx.send(RouteTask::RouteChanged(reason)).is_err() {
            tracing::warn!("Audio route controller stopped, dropping route change");
        }
    }

    /// Track gestartet oder gestoppt
    pub fn on_session_state_transition(&self, had_track: bool, has_track: bool) {
        let task = RouteTask::TrackTransition {
            had_track,
            has_track,
        };
        if self.tx.send(task).is_err() {
            tracing::warn!("Audio route controller stopped, dropping track transition");
        }
    }

    /// Konfiguriert die Session für Aufnahme und wartet bis die Queue es erledigt hat
    pub async fn prepare_capture(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RouteTask::PrepareCapture(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl std::fmt::Debug for RouteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RouteChanged(reason) => write!(f, "RouteChanged({:?})", reason),
            Self::TrackTransition {
                had_track,
                has_track,
            } => write!(f, "TrackTransition({} -> {})", had_track, has_track),
            Self::PrepareCapture(_) => write!(f, "PrepareCapture"),
        }
    }
}

pub struct AudioRouteController {
    session: Arc<dyn AudioSession>,
    snapshot: watch::Receiver<SessionSnapshot>,
    rx: mpsc::UnboundedReceiver<RouteTask>,
}

impl AudioRouteController {
    /// Startet den Controller auf einem eigenen Task
    pub fn spawn(
        session: Arc<dyn AudioSession>,
        snapshot: watch::Receiver<SessionSnapshot>,
    ) -> RouteControllerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            session,
            snapshot,
            rx,
        };
        tokio::spawn(controller.run());
        RouteControllerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            tracing::trace!("Audio route task: {:?}", task);
            self.process(task).await;
        }
        tracing::debug!("Audio route controller stopped");
    }

    async fn process(&self, task: RouteTask) {
        let session = Arc::clone(&self.session);

        match task {
            RouteTask::RouteChanged(reason) => {
                let has_active_track = self.snapshot.borrow().has_active_track;
                run_blocking(move || handle_route_change(&*session, reason, has_active_track))
                    .await;
            }
            RouteTask::TrackTransition {
                had_track,
                has_track,
            } => {
                run_blocking(move || handle_track_transition(&*session, had_track, has_track))
                    .await;
            }
            RouteTask::PrepareCapture(done) => {
                run_blocking(move || prepare_capture(&*session)).await;
                let _ = done.send(());
            }
        }
    }
}

async fn run_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = tokio::task::spawn_blocking(f).await {
        tracing::error!("Audio session task failed: {}", e);
    }
}

// ============================================================================
// TESTS
// ============================================================================
