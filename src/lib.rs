//! Tenten - Push-to-Talk Call Core
//!
//! Hält eine Walkie-Talkie Verbindung zwischen zwei Benutzern konsistent:
//! - Media-Relay (LiveKit Room) für Audio
//! - Presence-Records als Signalisierungskanal
//! - Audio-Session Routing bei Hardware-Wechseln
//! - Background-Leases damit Calls im Hintergrund weiterlaufen

pub mod config;
pub mod continuity;
pub mod media;
pub mod presence;
pub mod session;

use anyhow::Context;
use config::Config;
use continuity::{BackgroundLeaseApi, ContinuityLeaseManager, KeepAlivePlayer};
use media::{
    AudioRouteController, AudioSession, HttpTokenProvider, MediaRelay, RouteChangeReason,
    RouteControllerHandle, TokenProvider,
};
use presence::{PeerSelection, PresenceSignalBridge, PresenceStore};
use session::{
    snapshot_channel, CallEvent, CallSessionCoordinator, CoordinatorDeps, CoordinatorError,
    CoordinatorHandle, CoordinatorSettings, ScenePhase, SessionSnapshot,
};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Initialisiert Logging (mehrfacher Aufruf ist unschädlich)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tenten_lib=debug"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CLIENT
// ============================================================================

/// Plattform-Anbindungen, die der Client nicht selbst besitzt
pub struct Collaborators {
    pub local_user_id: String,
    pub relay: Arc<dyn MediaRelay>,
    /// `None` nutzt den HTTP Token-Endpoint aus der Konfiguration
    pub tokens: Option<Arc<dyn TokenProvider>>,
    pub presence: Arc<dyn PresenceStore>,
    pub audio_session: Arc<dyn AudioSession>,
    pub lease_api: Arc<dyn BackgroundLeaseApi>,
    pub keep_alive_player: Arc<dyn KeepAlivePlayer>,
}

/// Verdrahtet alle Komponenten eines Benutzers
pub struct CallClient {
    coordinator: CoordinatorHandle,
    route: RouteControllerHandle,
    leases: Arc<ContinuityLeaseManager>,
    bridge: PresenceSignalBridge,
    presence: Arc<dyn PresenceStore>,
}

impl CallClient {
    /// Startet Coordinator, Audio-Controller und Presence-Bridge
    ///
    /// Muss innerhalb einer Tokio Runtime aufgerufen werden.
    pub async fn start(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;
        let settings = CoordinatorSettings::from_config(&config)?;

        tracing::info!(
            "Starting call client for {} (relay: {})",
            collaborators.local_user_id,
            settings.relay_url
        );

        let tokens: Arc<dyn TokenProvider> = match collaborators.tokens {
            Some(tokens) => tokens,
            None => Arc::new(HttpTokenProvider::new(config.token_url()?)),
        };

        let leases = Arc::new(ContinuityLeaseManager::new(
            collaborators.lease_api,
            collaborators.keep_alive_player,
            config.keep_alive.clone(),
        ));

        let (snapshot_tx, snapshot_rx) = snapshot_channel();
        let route = AudioRouteController::spawn(collaborators.audio_session, snapshot_rx);

        let bridge = PresenceSignalBridge::new(
            Arc::clone(&collaborators.presence),
            collaborators.local_user_id,
        );

        let deps = CoordinatorDeps {
            relay: collaborators.relay,
            tokens,
            signals: Arc::new(bridge.signal_sink()),
            route: route.clone(),
            leases: Arc::clone(&leases),
        };
        let coordinator = CallSessionCoordinator::spawn(deps, settings, snapshot_tx);

        bridge
            .start(coordinator.clone())
            .await
            .context("Failed to watch own presence record")?;

        Ok(Self {
            coordinator,
            route,
            leases,
            bridge,
            presence: collaborators.presence,
        })
    }

    pub fn local_user_id(&self) -> &str {
        self.bridge.local_user_id()
    }

    pub async fn connect(&self, peer_id: &str) -> Result<(), CoordinatorError> {
        self.coordinator.connect(peer_id).await
    }

    pub async fn connect_selected(&self) -> Result<(), CoordinatorError> {
        self.coordinator.connect_selected().await
    }

    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.coordinator.disconnect().await
    }

    pub async fn publish(&self) -> Result<(), CoordinatorError> {
        self.coordinator.publish().await
    }

    pub async fn unpublish(&self) -> Result<(), CoordinatorError> {
        self.coordinator.unpublish().await
    }

    /// Lädt den Record des Peers und beobachtet ihn ab jetzt
    pub async fn select_peer(&self, peer_id: &str) -> anyhow::Result<PeerSelection> {
        let record = self
            .presence
            .fetch(peer_id)
            .await
            .with_context(|| format!("Failed to load peer {}", peer_id))?;
        let selection = PeerSelection::from_record(&record);

        self.bridge
            .watch_peer(selection.clone(), self.coordinator.clone())
            .await?;
        Ok(selection)
    }

    /// Vom OS-Callback aufgerufen
    pub fn on_route_change(&self, reason: RouteChangeReason) {
        self.route.on_route_change(reason);
    }

    pub async fn scene_phase_changed(&self, phase: ScenePhase) -> Result<(), CoordinatorError> {
        self.coordinator.scene_phase_changed(phase).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.coordinator.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.coordinator.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn leases(&self) -> &ContinuityLeaseManager {
        &self.leases
    }

    /// Beendet Subscriptions, gibt über den Coordinator alle Leases frei
    /// und stoppt ihn; weitere Anfragen liefern `CoordinatorError::Stopped`
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down call client for {}", self.local_user_id());
        self.bridge.stop();
        if self.coordinator.shutdown().await.is_err() {
            tracing::debug!("Coordinator already stopped");
        }
    }
}

impl std::fmt::Debug for CallClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallClient")
            .field("local_user_id", &self.local_user_id())
            .field("session", &self.snapshot())
            .field("leases", &self.leases)
            .finish()
    }
}
