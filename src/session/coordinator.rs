//! Call Session Coordinator
//!
//! Einziger Besitzer der `CallSession`. Alle Übergänge laufen als
//! `Command` über eine Queue in einen Task und werden dort nacheinander
//! abgearbeitet; Netzwerk-Aufrufe werden innerhalb des Tasks awaited, so
//! dass ihre Ergebnisse wieder im serialisierten Kontext ankommen.

use super::events::CallEvent;
use super::state::{CallSession, ConnectionState, PublishState, ScenePhase, SessionSnapshot};
use crate::config::{Config, ConfigError};
use crate::continuity::{ContinuityLeaseManager, LeaseRole};
use crate::media::{
    LocalAudioTrack, MediaRelay, RelayConnectionState, RelayError, RouteControllerHandle,
    TokenError, TokenProvider,
};
use crate::presence::{CallSignalSink, IncomingCallSignal, PeerSelection, PresenceError};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Call session coordinator stopped")]
    Stopped,
}

/// Fehler einer externen Operation innerhalb eines Übergangs
#[derive(Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Begrenzt eine externe Operation auf `after`
async fn bounded<T, E, F>(after: Duration, operation: &'static str, fut: F) -> Result<T, OperationError>
where
    F: Future<Output = Result<T, E>>,
    OperationError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(OperationError::from),
        Err(_) => Err(OperationError::Timeout { operation, after }),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug)]
enum Command {
    Connect { peer_id: String },
    ConnectSelected,
    Disconnect,
    Publish,
    Unpublish,
    IncomingSignal(IncomingCallSignal),
    SelectPeer(PeerSelection),
    ScenePhase(ScenePhase),
    Shutdown,
}

struct Envelope {
    command: Command,
    ack: Option<oneshot::Sender<()>>,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle auf den Coordinator-Task
///
/// Die async Methoden kehren zurück sobald der Übergang vollständig
/// abgearbeitet ist. Fehler der externen Dienste kommen als `CallEvent`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Envelope>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CoordinatorHandle {
    async fn request(&self, command: Command) -> Result<(), CoordinatorError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope {
                command,
                ack: Some(ack),
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        done.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub async fn connect(&self, peer_id: impl Into<String>) -> Result<(), CoordinatorError> {
        self.request(Command::Connect {
            peer_id: peer_id.into(),
        })
        .await
    }

    /// Verbindet mit dem aktuell ausgewählten Peer
    pub async fn connect_selected(&self) -> Result<(), CoordinatorError> {
        self.request(Command::ConnectSelected).await
    }

    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Disconnect).await
    }

    pub async fn publish(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Publish).await
    }

    pub async fn unpublish(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Unpublish).await
    }

    pub async fn select_peer(&self, selection: PeerSelection) -> Result<(), CoordinatorError> {
        self.request(Command::SelectPeer(selection)).await
    }

    pub async fn scene_phase_changed(&self, phase: ScenePhase) -> Result<(), CoordinatorError> {
        self.request(Command::ScenePhase(phase)).await
    }

    /// Gibt die Continuity-Leases frei und beendet den Task
    ///
    /// Danach liefern alle Anfragen `CoordinatorError::Stopped`.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.request(Command::Shutdown).await
    }

    /// Reiht ein eingehendes Signal ein, ohne auf den Übergang zu warten
    pub async fn incoming_signal(&self, signal: IncomingCallSignal) -> Result<(), CoordinatorError> {
        self.tx
            .send(Envelope {
                command: Command::IncomingSignal(signal),
                ack: None,
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Externe Dienste, mit denen der Coordinator spricht
pub struct CoordinatorDeps {
    pub relay: Arc<dyn MediaRelay>,
    pub tokens: Arc<dyn TokenProvider>,
    pub signals: Arc<dyn CallSignalSink>,
    pub route: RouteControllerHandle,
    pub leases: Arc<ContinuityLeaseManager>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub relay_url: Url,
    pub operation_timeout: Duration,
    pub command_queue_capacity: usize,
    pub event_channel_capacity: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            relay_url: config.relay_url()?,
            operation_timeout: config.operation_timeout(),
            command_queue_capacity: config.command_queue_capacity,
            event_channel_capacity: config.event_channel_capacity,
        })
    }
}

pub struct CallSessionCoordinator {
    deps: CoordinatorDeps,
    relay_url: Url,
    timeout: Duration,
    session: CallSession,
    selected_peer: Option<PeerSelection>,
    scene_phase: ScenePhase,
    continuity_held: bool,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
    rx: mpsc::Receiver<Envelope>,
    relay_states: Option<broadcast::Receiver<RelayConnectionState>>,
}

impl CallSessionCoordinator {
    /// Startet den Coordinator auf einem eigenen Task
    ///
    /// `snapshot_tx` wird vorab erstellt, damit der Audio-Controller den
    /// Snapshot schon vor dem Coordinator lesen kann.
    pub fn spawn(
        deps: CoordinatorDeps,
        settings: CoordinatorSettings,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(settings.command_queue_capacity);
        let (events, _) = broadcast::channel(settings.event_channel_capacity);
        let snapshot = snapshot_tx.subscribe();
        let relay_states = Some(deps.relay.subscribe_state());

        let coordinator = Self {
            deps,
            relay_url: settings.relay_url,
            timeout: settings.operation_timeout,
            session: CallSession::default(),
            selected_peer: None,
            scene_phase: ScenePhase::Active,
            continuity_held: false,
            snapshot_tx,
            events: events.clone(),
            rx,
            relay_states,
        };
        tokio::spawn(coordinator.run());

        CoordinatorHandle {
            tx,
            snapshot,
            events,
        }
    }

    async fn run(mut self) {
        tracing::info!("Call session coordinator started");

        loop {
            tokio::select! {
                envelope = self.rx.recv() => match envelope {
                    Some(Envelope { command: Command::Shutdown, ack }) => {
                        tracing::info!("Coordinator shutdown requested");
                        self.release_continuity();
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        break;
                    }
                    Some(Envelope { command, ack }) => {
                        tracing::debug!("Coordinator command: {:?}", command);
                        self.handle(command).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    None => break,
                },
                state = next_relay_state(&mut self.relay_states) => match state {
                    Ok(state) => self.on_relay_state(state).await,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} relay state changes", n);
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("Relay state stream closed");
                        self.relay_states = None;
                    }
                },
            }
        }

        self.release_continuity();
        tracing::info!("Call session coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { peer_id } => self.connect(peer_id).await,
            Command::ConnectSelected => match self.selected_peer.as_ref() {
                Some(selection) => {
                    let peer_id = selection.peer_id.clone();
                    self.connect(peer_id).await;
                }
                None => tracing::warn!("Connect requested without a selected peer"),
            },
            Command::Disconnect => self.disconnect().await,
            Command::Publish => self.publish().await,
            Command::Unpublish => self.unpublish().await,
            Command::IncomingSignal(signal) => self.on_incoming_signal(signal).await,
            Command::SelectPeer(selection) => {
                tracing::debug!("Selected peer {}", selection.peer_id);
                self.selected_peer = Some(selection.clone());
                self.emit(CallEvent::PeerUpdated(selection));
            }
            Command::ScenePhase(phase) => self.on_scene_phase(phase),
            Command::Shutdown => {}
        }
    }

    // ========================================================================
    // CONNECTION
    // ========================================================================

    async fn connect(&mut self, peer_id: String) {
        match self.session.connection_state {
            ConnectionState::Idle => {}
            ConnectionState::Connected if self.session.peer_id.as_deref() == Some(&peer_id) => {
                tracing::debug!("Already connected to {}", peer_id);
                return;
            }
            state => {
                tracing::debug!("Ignoring connect to {} in state {:?}", peer_id, state);
                return;
            }
        }

        tracing::info!("Connecting to room for {}", peer_id);
        self.session.connection_state = ConnectionState::Connecting;
        self.session.peer_id = Some(peer_id.clone());
        self.commit();

        let result = self.establish().await;
        self.discard_relay_echo();

        match result {
            Ok(()) => {
                self.session.connection_state = ConnectionState::Connected;
                self.session.connected_at = Some(Utc::now());
                self.commit();
                tracing::info!("Connected to room for {}", peer_id);
                self.signal_peer(&peer_id, true).await;
            }
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", peer_id, e);
                self.session.reset();
                self.commit();
                self.emit(CallEvent::ConnectionFailed {
                    peer_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn establish(&self) -> Result<(), OperationError> {
        let credential = bounded(self.timeout, "token fetch", self.deps.tokens.fetch_token()).await?;

        let connected = bounded(
            self.timeout,
            "relay connect",
            self.deps.relay.connect(&self.relay_url, &credential),
        )
        .await;

        if let Err(OperationError::Timeout { .. }) = connected {
            // Ein verspäteter Join darf nicht im Room hängen bleiben
            let _ = bounded(self.timeout, "relay disconnect", self.deps.relay.disconnect()).await;
        }
        connected
    }

    async fn disconnect(&mut self) {
        if self.session.connection_state != ConnectionState::Connected {
            tracing::debug!(
                "Ignoring disconnect in state {:?}",
                self.session.connection_state
            );
            return;
        }

        if self.session.publish_state == PublishState::Published {
            if let Err(e) = self.unpublish_track().await {
                tracing::warn!("Unpublish before disconnect failed: {}", e);
            }
            if self.session.media_handle.take().is_some() {
                self.session.publish_state = PublishState::NotPublished;
                self.commit();
                self.deps.route.on_session_state_transition(true, false);
            }
        }

        let peer_id = self.session.peer_id.clone();
        tracing::info!("Disconnecting from room");
        self.session.connection_state = ConnectionState::Disconnecting;
        self.commit();

        let result = bounded(self.timeout, "relay disconnect", self.deps.relay.disconnect()).await;
        self.discard_relay_echo();
        if let Err(e) = result {
            tracing::error!("Failed to disconnect from room: {}", e);
            self.emit(CallEvent::DisconnectFailed {
                reason: e.to_string(),
            });
        }

        if let Some(peer_id) = &peer_id {
            self.signal_peer(peer_id, false).await;
        }
        self.session.reset();
        self.commit();
        tracing::info!("Disconnected from room");
    }

    async fn on_incoming_signal(&mut self, signal: IncomingCallSignal) {
        let requester = signal
            .requester_id
            .clone()
            .or_else(|| self.selected_peer.as_ref().map(|p| p.peer_id.clone()));
        let Some(requester) = requester else {
            tracing::warn!("Incoming call signal without requester, ignoring");
            return;
        };

        if signal.flag_value {
            if self.session.connection_state == ConnectionState::Idle {
                tracing::info!("Incoming call from {}", requester);
                self.connect(requester).await;
            } else {
                tracing::debug!(
                    "Ignoring incoming call from {} in state {:?}",
                    requester,
                    self.session.connection_state
                );
            }
        } else if self.session.is_connected_to(&requester) {
            tracing::info!("{} ended the call", requester);
            self.disconnect().await;
        } else {
            tracing::debug!("Ignoring call end from {}", requester);
        }
    }

    async fn on_relay_state(&mut self, state: RelayConnectionState) {
        if self.session.connection_state != ConnectionState::Connected {
            tracing::trace!("Relay state {:?} outside of a call", state);
            return;
        }

        match state {
            RelayConnectionState::Reconnecting => {
                tracing::warn!("Relay connection interrupted, reconnecting");
                self.emit(CallEvent::Reconnecting);
            }
            RelayConnectionState::Disconnected => {
                let peer_id = self.session.peer_id.clone();
                let had_track = self.session.has_active_track();
                tracing::warn!("Relay connection lost");

                self.session.reset();
                self.commit();
                if had_track {
                    self.deps.route.on_session_state_transition(true, false);
                }
                if let Some(peer_id) = &peer_id {
                    self.signal_peer(peer_id, false).await;
                }
                self.emit(CallEvent::ConnectionLost { peer_id });
            }
            RelayConnectionState::Connecting | RelayConnectionState::Connected => {
                tracing::trace!("Relay state {:?}", state);
            }
        }
    }

    /// Verwirft Statusmeldungen, die der eigene connect/disconnect ausgelöst hat
    fn discard_relay_echo(&mut self) {
        let Some(states) = self.relay_states.as_mut() else {
            return;
        };
        loop {
            match states.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn signal_peer(&self, peer_id: &str, active: bool) {
        let result = bounded(
            self.timeout,
            "presence write",
            self.deps.signals.signal_peer(peer_id, active),
        )
        .await;

        match result {
            Ok(()) => tracing::debug!("Set incoming call flag for {} to {}", peer_id, active),
            Err(e) => tracing::warn!(
                "Failed to set incoming call flag for {} to {}: {}",
                peer_id,
                active,
                e
            ),
        }
    }

    // ========================================================================
    // PUBLISHING
    // ========================================================================

    async fn publish(&mut self) {
        if self.session.connection_state != ConnectionState::Connected
            || self.session.publish_state != PublishState::NotPublished
        {
            tracing::debug!(
                "Ignoring publish in state {:?}/{:?}",
                self.session.connection_state,
                self.session.publish_state
            );
            return;
        }

        self.session.publish_state = PublishState::Publishing;
        self.commit();

        self.deps.route.prepare_capture().await;

        let track = LocalAudioTrack::microphone();
        match bounded(self.timeout, "track publish", self.deps.relay.publish(track)).await {
            Ok(handle) => {
                tracing::info!("Published microphone track {}", handle.sid);
                self.session.media_handle = Some(handle);
                self.session.publish_state = PublishState::Published;
                self.commit();
                self.deps.route.on_session_state_transition(false, true);
            }
            Err(e) => {
                tracing::error!("Failed to publish microphone track: {}", e);
                self.session.publish_state = PublishState::NotPublished;
                self.commit();
                self.emit(CallEvent::PublishFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn unpublish(&mut self) {
        if self.session.publish_state != PublishState::Published {
            tracing::debug!(
                "Ignoring unpublish in state {:?}",
                self.session.publish_state
            );
            return;
        }

        if let Err(e) = self.unpublish_track().await {
            self.emit(CallEvent::UnpublishFailed {
                reason: e.to_string(),
            });
        }
    }

    /// Bei Fehler bleibt der Track veröffentlicht
    async fn unpublish_track(&mut self) -> Result<(), OperationError> {
        let Some(handle) = self.session.media_handle.clone() else {
            self.session.publish_state = PublishState::NotPublished;
            self.commit();
            return Ok(());
        };

        self.session.publish_state = PublishState::Unpublishing;
        self.commit();

        match bounded(self.timeout, "track unpublish", self.deps.relay.unpublish(&handle)).await {
            Ok(()) => {
                tracing::info!("Unpublished microphone track {}", handle.sid);
                self.session.media_handle = None;
                self.session.publish_state = PublishState::NotPublished;
                self.commit();
                self.deps.route.on_session_state_transition(true, false);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to unpublish microphone track: {}", e);
                self.session.publish_state = PublishState::Published;
                self.commit();
                Err(e)
            }
        }
    }

    // ========================================================================
    // CONTINUITY
    // ========================================================================

    fn on_scene_phase(&mut self, phase: ScenePhase) {
        if phase == self.scene_phase {
            return;
        }
        tracing::info!("Scene phase changed: {:?} -> {:?}", self.scene_phase, phase);
        self.scene_phase = phase;
        self.sync_continuity();
    }

    /// Hintergrund mit laufendem oder ausstehendem Call hält die Leases
    fn sync_continuity(&mut self) {
        let in_call = self.session.connection_state != ConnectionState::Idle;
        let wanted = match self.scene_phase {
            ScenePhase::Background => in_call,
            ScenePhase::Inactive => self.continuity_held && in_call,
            ScenePhase::Active => false,
        };
        if wanted == self.continuity_held {
            return;
        }

        if wanted {
            tracing::info!("Call active in background, acquiring continuity leases");
            self.deps.leases.acquire(LeaseRole::CallContinuity);
            self.deps.leases.start_keep_alive();
            self.continuity_held = true;
        } else {
            self.release_continuity();
        }
    }

    fn release_continuity(&mut self) {
        if !self.continuity_held {
            return;
        }
        tracing::info!("Releasing continuity leases");
        self.deps.leases.stop_keep_alive();
        self.deps.leases.release(LeaseRole::CallContinuity);
        self.continuity_held = false;
    }

    // ========================================================================
    // STATE PUBLISHING
    // ========================================================================

    fn commit(&mut self) {
        if let Err(violation) = self.session.check_invariants() {
            tracing::error!("Call session invariant violated: {}", violation);
        }

        let snapshot = self.session.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        self.emit(CallEvent::StateChanged(snapshot));
        self.sync_continuity();
    }

    fn emit(&self, event: CallEvent) {
        // Fehler nur wenn niemand zuhört
        let _ = self.events.send(event);
    }
}

async fn next_relay_state(
    states: &mut Option<broadcast::Receiver<RelayConnectionState>>,
) -> Result<RelayConnectionState, RecvError> {
    match states {
        Some(states) => states.recv().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), OperationError> = bounded(
            Duration::from_secs(15),
            "relay connect",
            std::future::pending::<Result<(), RelayError>>(),
        )
        .await;

        match result {
            Err(OperationError::Timeout { operation, after }) => {
                assert_eq!(operation, "relay connect");
                assert_eq!(after, Duration::from_secs(15));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bounded_passes_through_errors() {
        let result: Result<(), OperationError> = bounded(Duration::from_secs(1), "relay connect", async {
            Err::<(), _>(RelayError::NotConnected)
        })
        .await;

        assert!(matches!(result, Err(OperationError::Relay(RelayError::NotConnected))));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = CoordinatorSettings::from_config(&Config::default()).unwrap();
        assert_eq!(settings.operation_timeout, Duration::from_secs(15));
        assert_eq!(settings.relay_url.scheme(), "wss");
    }
}
