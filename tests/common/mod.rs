#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenten_lib::config::Config;
use tenten_lib::continuity::{BackgroundLeaseApi, ExpirationHandler, KeepAlivePlayer, LeaseHandle, LeaseRole};
use tenten_lib::media::{
    AudioSession, AudioSessionConfig, AudioSessionError, LocalAudioTrack, MediaRelay,
    PublicationHandle, RelayConnectionState, RelayError, RoomCredential, TokenError, TokenProvider,
};
use tenten_lib::presence::{MemoryPresenceStore, PresenceRecord};
use tenten_lib::session::{CallEvent, SessionSnapshot};
use tenten_lib::{CallClient, Collaborators};
use tokio::sync::{broadcast, watch, Notify};
use url::Url;

// ============================================================================
// RELAY
// ============================================================================

/// Hält einen Relay-Aufruf offen bis der Test ihn freigibt
#[derive(Default)]
pub struct Gate {
    closed: AtomicBool,
    entered: AtomicUsize,
    opened: Notify,
}

impl Gate {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.opened.notify_waiters();
    }

    /// Wartet bis `count` Aufrufe das Gate erreicht haben
    pub async fn wait_entered(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.entered.load(Ordering::SeqCst) < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("relay call did not reach the gate");
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        loop {
            let opened = self.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();
            if !self.closed.load(Ordering::SeqCst) {
                return;
            }
            opened.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCall {
    Connect { url: String, token: String },
    Disconnect,
    Publish,
    Unpublish(String),
}

pub struct FakeRelay {
    state_tx: broadcast::Sender<RelayConnectionState>,
    calls: Mutex<Vec<RelayCall>>,
    next_sid: AtomicU64,
    pub fail_connect: AtomicBool,
    pub hang_connect: AtomicBool,
    pub fail_publish: AtomicBool,
    pub fail_unpublish: AtomicBool,
    pub connect_gate: Gate,
    pub publish_gate: Gate,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            state_tx,
            calls: Mutex::new(Vec::new()),
            next_sid: AtomicU64::new(1),
            fail_connect: AtomicBool::new(false),
            hang_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_unpublish: AtomicBool::new(false),
            connect_gate: Gate::default(),
            publish_gate: Gate::default(),
        })
    }

    pub fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == RelayCall::Publish)
            .count()
    }

    /// Simuliert eine Statusänderung des Relay-Dienstes
    pub fn emit(&self, state: RelayConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

#[async_trait]
impl MediaRelay for FakeRelay {
    async fn connect(&self, server_url: &Url, credential: &RoomCredential) -> Result<(), RelayError> {
        self.calls.lock().push(RelayCall::Connect {
            url: server_url.to_string(),
            token: credential.as_str().to_string(),
        });
        self.connect_gate.pass().await;
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RelayError::ConnectFailed("room refused".to_string()));
        }
        self.emit(RelayConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        self.calls.lock().push(RelayCall::Disconnect);
        self.emit(RelayConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, track: LocalAudioTrack) -> Result<PublicationHandle, RelayError> {
        self.calls.lock().push(RelayCall::Publish);
        self.publish_gate.pass().await;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(RelayError::PublishFailed("track rejected".to_string()));
        }
        let sid = format!("TR_{}", self.next_sid.fetch_add(1, Ordering::SeqCst));
        Ok(PublicationHandle {
            sid,
            track_id: track.id,
        })
    }

    async fn unpublish(&self, publication: &PublicationHandle) -> Result<(), RelayError> {
        self.calls
            .lock()
            .push(RelayCall::Unpublish(publication.sid.clone()));
        if self.fail_unpublish.load(Ordering::SeqCst) {
            return Err(RelayError::UnpublishFailed("relay busy".to_string()));
        }
        Ok(())
    }

    fn subscribe_state(&self) -> broadcast::Receiver<RelayConnectionState> {
        self.state_tx.subscribe()
    }
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Default)]
pub struct FakeTokens {
    pub fail: AtomicBool,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn fetch_token(&self) -> Result<RoomCredential, TokenError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TokenError::Status(500));
        }
        Ok(RoomCredential::new("tok123"))
    }
}

// ============================================================================
// AUDIO SESSION
// ============================================================================

pub struct FakeAudioSession {
    current: Mutex<AudioSessionConfig>,
    pub applied: Mutex<Vec<(AudioSessionConfig, Option<bool>)>>,
}

impl FakeAudioSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(AudioSessionConfig::call_default()),
            applied: Mutex::new(Vec::new()),
        })
    }

    pub fn applied(&self) -> Vec<(AudioSessionConfig, Option<bool>)> {
        self.applied.lock().clone()
    }

    pub fn current_config(&self) -> AudioSessionConfig {
        *self.current.lock()
    }
}

impl AudioSession for FakeAudioSession {
    fn current(&self) -> AudioSessionConfig {
        *self.current.lock()
    }

    fn apply(&self, config: &AudioSessionConfig, active: Option<bool>) -> Result<(), AudioSessionError> {
        self.applied.lock().push((*config, active));
        *self.current.lock() = *config;
        Ok(())
    }

    fn set_active(&self, _active: bool) -> Result<(), AudioSessionError> {
        Ok(())
    }
}

// ============================================================================
// LEASES
// ============================================================================

#[derive(Default)]
struct LeaseBook {
    next: u64,
    outstanding: HashMap<LeaseHandle, LeaseRole>,
    handlers: HashMap<LeaseHandle, ExpirationHandler>,
    begins: Vec<(LeaseRole, LeaseHandle)>,
    ends: Vec<LeaseHandle>,
    max_outstanding_per_role: usize,
}

#[derive(Default)]
pub struct FakeLeaseApi {
    book: Mutex<LeaseBook>,
    pub deny: AtomicBool,
}

impl FakeLeaseApi {
    pub fn begins(&self, role: LeaseRole) -> Vec<LeaseHandle> {
        self.book
            .lock()
            .begins
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, h)| *h)
            .collect()
    }

    pub fn end_count(&self, handle: LeaseHandle) -> usize {
        self.book.lock().ends.iter().filter(|h| **h == handle).count()
    }

    pub fn outstanding(&self, role: LeaseRole) -> usize {
        self.book
            .lock()
            .outstanding
            .values()
            .filter(|r| **r == role)
            .count()
    }

    pub fn max_outstanding_per_role(&self) -> usize {
        self.book.lock().max_outstanding_per_role
    }

    /// OS entzieht den Lease; der Handler läuft außerhalb des Locks
    pub fn expire(&self, handle: LeaseHandle) {
        let handler = self.book.lock().handlers.remove(&handle);
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl BackgroundLeaseApi for FakeLeaseApi {
    fn begin(&self, role: LeaseRole, on_expiration: ExpirationHandler) -> Option<LeaseHandle> {
        if self.deny.load(Ordering::SeqCst) {
            return None;
        }
        let mut book = self.book.lock();
        book.next += 1;
        let handle = LeaseHandle(book.next);
        book.outstanding.insert(handle, role);
        book.handlers.insert(handle, on_expiration);
        book.begins.push((role, handle));
        let count = book.outstanding.values().filter(|r| **r == role).count();
        book.max_outstanding_per_role = book.max_outstanding_per_role.max(count);
        Some(handle)
    }

    fn end(&self, handle: LeaseHandle) {
        let mut book = self.book.lock();
        book.ends.push(handle);
        book.outstanding.remove(&handle);
        book.handlers.remove(&handle);
    }
}

#[derive(Default)]
pub struct CountingPlayer {
    playing: AtomicBool,
    pub plays: AtomicUsize,
    pub stops: AtomicUsize,
}

impl KeepAlivePlayer for CountingPlayer {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Store mit je einem Record pro Benutzer
pub fn seeded_store(user_ids: &[&str]) -> Arc<MemoryPresenceStore> {
    let store = Arc::new(MemoryPresenceStore::new());
    for id in user_ids {
        let mut record = PresenceRecord::new(*id, *id);
        record.device_token = format!("apns-{}", id);
        store.insert(record);
    }
    store
}

pub struct Harness {
    pub client: CallClient,
    pub relay: Arc<FakeRelay>,
    pub tokens: Arc<FakeTokens>,
    pub audio: Arc<FakeAudioSession>,
    pub lease_api: Arc<FakeLeaseApi>,
    pub player: Arc<CountingPlayer>,
}

impl Harness {
    pub async fn start(user_id: &str, store: Arc<MemoryPresenceStore>) -> Self {
        let relay = FakeRelay::new();
        let tokens = Arc::new(FakeTokens::default());
        let audio = FakeAudioSession::new();
        let lease_api = Arc::new(FakeLeaseApi::default());
        let player = Arc::new(CountingPlayer::default());

        let collaborators = Collaborators {
            local_user_id: user_id.to_string(),
            relay: relay.clone(),
            tokens: Some(tokens.clone()),
            presence: store,
            audio_session: audio.clone(),
            lease_api: lease_api.clone(),
            keep_alive_player: player.clone(),
        };
        let client = CallClient::start(Config::default(), collaborators)
            .await
            .expect("client starts");

        Self {
            client,
            relay,
            tokens,
            audio,
            lease_api,
            player,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.client.snapshot()
    }
}

/// Wartet bis der Snapshot `pred` erfüllt
pub async fn wait_for_state<F>(client: &CallClient, pred: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let mut rx: watch::Receiver<SessionSnapshot> = client.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("coordinator stopped")
        .clone();
    snapshot
}

/// Wartet auf das erste Event, das `pred` erfüllt
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Alle bisher empfangenen Events ohne zu warten
pub fn drain_events(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    drained
}

/// Wartet bis das Incoming-Call Flag im Record `record_id` den Wert `value` hat
pub async fn wait_for_flag(store: &MemoryPresenceStore, record_id: &str, value: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = store
                .get(record_id)
                .map(|record| record.has_incoming_call_request);
            if current == Some(value) {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("timed out waiting for incoming call flag");
}
