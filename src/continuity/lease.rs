//! Continuity Lease Manager
//!
//! Hält die App im Hintergrund am Leben solange ein Call aktiv ist.
//! Pro Rolle existiert höchstens ein aktiver Lease. Der Audio-Lease wird
//! von einer Keep-Alive Schleife periodisch erneuert, bis der Aufrufer die
//! Schleife stoppt oder das OS den Lease entzieht.

use super::player::KeepAlivePlayer;
use crate::config::KeepAliveConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

// ============================================================================
// OS LEASE API
// ============================================================================

/// Zweck eines Background-Leases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseRole {
    /// Hält eine laufende Relay-Verbindung am Leben
    CallContinuity,
    /// Wird von der Keep-Alive Schleife erneuert
    AudioKeepAlive,
}

impl LeaseRole {
    pub fn task_name(self) -> &'static str {
        match self {
            Self::CallContinuity => "CallContinuityTask",
            Self::AudioKeepAlive => "AudioTask",
        }
    }
}

/// Opakes Token des Betriebssystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseHandle(pub u64);

/// Wird vom OS aufgerufen kurz bevor der Lease entzogen wird
pub type ExpirationHandler = Box<dyn FnOnce() + Send + 'static>;

pub trait BackgroundLeaseApi: Send + Sync {
    /// Gibt `None` zurück wenn das OS keinen Lease gewährt
    fn begin(&self, role: LeaseRole, on_expiration: ExpirationHandler) -> Option<LeaseHandle>;

    fn end(&self, handle: LeaseHandle);
}

/// Zustand eines Leases, wie ihn der Manager verwaltet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuityLease {
    pub handle: LeaseHandle,
    pub is_active: bool,
    pub renewal_attempt: u32,
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// Verbindet den Expiration-Callback mit dem später bekannten Handle
#[derive(Default)]
struct IssuedLease {
    handle: Mutex<Option<LeaseHandle>>,
    expired: AtomicBool,
}

struct LeaseState {
    api: Arc<dyn BackgroundLeaseApi>,
    player: Arc<dyn KeepAlivePlayer>,
    config: KeepAliveConfig,
    leases: Mutex<HashMap<LeaseRole, ContinuityLease>>,
    keep_alive_live: AtomicBool,
    keep_alive_generation: AtomicU64,
    keep_alive_task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseState {
    /// `guard` bindet die Erneuerung an eine Keep-Alive Generation
    fn acquire(
        self: &Arc<Self>,
        role: LeaseRole,
        renewal_attempt: u32,
        guard: Option<u64>,
    ) -> bool {
        // Vorhandenen Lease derselben Rolle zuerst beenden
        if !self.release_guarded(role, guard) {
            return false;
        }

        let issued = Arc::new(IssuedLease::default());
        let issued_cb = Arc::clone(&issued);
        let weak = Arc::downgrade(self);
        let on_expiration: ExpirationHandler = Box::new(move || {
            issued_cb.expired.store(true, Ordering::SeqCst);
            let handle = *issued_cb.handle.lock();
            if let (Some(state), Some(handle)) = (weak.upgrade(), handle) {
                state.expire(role, handle);
            }
        });

        let Some(handle) = self.api.begin(role, on_expiration) else {
            tracing::warn!(
                "Failed to start {} background lease, continuing without",
                role.task_name()
            );
            return false;
        };
        *issued.handle.lock() = Some(handle);

        let lease = ContinuityLease {
            handle,
            is_active: true,
            renewal_attempt,
        };
        let displaced = {
            let mut leases = self.leases.lock();
            // Schleife wurde während `begin` gestoppt oder ersetzt
            if guard.is_some_and(|generation| !self.is_live(generation)) {
                drop(leases);
                tracing::info!(
                    "Keep-alive stopped during renewal, ending {} lease {:?}",
                    role.task_name(),
                    handle
                );
                self.api.end(handle);
                return false;
            }
            leases.insert(role, lease)
        };
        if let Some(old) = displaced.filter(|old| old.is_active) {
            // Paralleles acquire für dieselbe Rolle
            self.api.end(old.handle);
        }

        tracing::info!(
            "Started {} background lease {:?} (renewal {})",
            role.task_name(),
            handle,
            renewal_attempt
        );

        // Callback kam bevor das Handle bekannt war
        if issued.expired.load(Ordering::SeqCst) {
            self.expire(role, handle);
        }
        true
    }

    fn release(&self, role: LeaseRole) {
        self.release_guarded(role, None);
    }

    /// `false` wenn die Generation nicht mehr läuft; dann bleibt alles unberührt
    fn release_guarded(&self, role: LeaseRole, guard: Option<u64>) -> bool {
        let released = {
            let mut leases = self.leases.lock();
            if guard.is_some_and(|generation| !self.is_live(generation)) {
                return false;
            }
            match leases.get_mut(&role) {
                Some(lease) if lease.is_active => {
                    lease.is_active = false;
                    Some(lease.handle)
                }
                _ => None,
            }
        };

        if let Some(handle) = released {
            tracing::info!("Ending {} background lease {:?}", role.task_name(), handle);
            self.api.end(handle);
        }
        true
    }

    /// Expiration durch das OS, gilt nur für genau dieses Handle
    fn expire(&self, role: LeaseRole, handle: LeaseHandle) {
        let expired = {
            let mut leases = self.leases.lock();
            match leases.get_mut(&role) {
                Some(lease) if lease.is_active && lease.handle == handle => {
                    lease.is_active = false;
                    true
                }
                _ => false,
            }
        };

        if !expired {
            return;
        }

        tracing::warn!(
            "{} background lease {:?} expired",
            role.task_name(),
            handle
        );
        if role == LeaseRole::AudioKeepAlive {
            self.keep_alive_live.store(false, Ordering::SeqCst);
        }
        self.api.end(handle);
    }

    fn is_live(&self, generation: u64) -> bool {
        self.keep_alive_live.load(Ordering::SeqCst)
            && self.keep_alive_generation.load(Ordering::SeqCst) == generation
    }

    async fn run_keep_alive(self: Arc<Self>, generation: u64) {
        self.player.play();

        let mut renewal_attempt = 0;
        'lease: loop {
            for tick in 1..=self.config.ticks_per_lease {
                if !self.is_live(generation) {
                    break 'lease;
                }
                if self.player.is_playing() {
                    tracing::debug!("Playing silent audio ({})...", tick);
                } else {
                    tracing::debug!("Keep-alive tick ({}) without audio", tick);
                }
                tokio::time::sleep(self.config.tick_interval()).await;
            }

            if !self.is_live(generation) {
                break;
            }

            renewal_attempt += 1;
            tracing::info!("Renewing keep-alive lease (attempt {})", renewal_attempt);
            if !self.acquire(LeaseRole::AudioKeepAlive, renewal_attempt, Some(generation)) {
                if self.keep_alive_generation.load(Ordering::SeqCst) == generation {
                    self.keep_alive_live.store(false, Ordering::SeqCst);
                }
                break;
            }
        }

        // Eine neuere Schleife hat übernommen
        if self.keep_alive_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.player.stop();
        self.release(LeaseRole::AudioKeepAlive);
        tracing::info!("Background keep-alive loop finished");
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ContinuityLeaseManager {
    state: Arc<LeaseState>,
}

impl ContinuityLeaseManager {
    pub fn new(
        api: Arc<dyn BackgroundLeaseApi>,
        player: Arc<dyn KeepAlivePlayer>,
        config: KeepAliveConfig,
    ) -> Self {
        Self {
            state: Arc::new(LeaseState {
                api,
                player,
                config,
                leases: Mutex::new(HashMap::new()),
                keep_alive_live: AtomicBool::new(false),
                keep_alive_generation: AtomicU64::new(0),
                keep_alive_task: Mutex::new(None),
            }),
        }
    }

    /// Fordert einen Lease an; `false` wenn das OS ablehnt (degradierter Modus)
    pub fn acquire(&self, role: LeaseRole) -> bool {
        self.state.acquire(role, 0, None)
    }

    /// Idempotent
    pub fn release(&self, role: LeaseRole) {
        self.state.release(role);
    }

    pub fn lease(&self, role: LeaseRole) -> Option<ContinuityLease> {
        self.state.leases.lock().get(&role).copied()
    }

    pub fn is_active(&self, role: LeaseRole) -> bool {
        self.lease(role).map(|l| l.is_active).unwrap_or(false)
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.state.keep_alive_live.load(Ordering::SeqCst)
    }

    /// Startet die Keep-Alive Schleife (ersetzt eine laufende)
    ///
    /// Muss innerhalb einer Tokio Runtime aufgerufen werden.
    pub fn start_keep_alive(&self) {
        let state = &self.state;
        let generation = state.keep_alive_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = state.keep_alive_task.lock().take() {
            previous.abort();
        }

        tracing::info!("Starting background keep-alive");
        state.keep_alive_live.store(true, Ordering::SeqCst);
        if !state.acquire(LeaseRole::AudioKeepAlive, 0, Some(generation)) {
            state.keep_alive_live.store(false, Ordering::SeqCst);
            return;
        }

        let task = tokio::spawn(Arc::clone(state).run_keep_alive(generation));
        *state.keep_alive_task.lock() = Some(task);
    }

    /// Stoppt die Schleife, das Keep-Alive Audio und gibt den Audio-Lease frei
    pub fn stop_keep_alive(&self) {
        let state = &self.state;
        state.keep_alive_generation.fetch_add(1, Ordering::SeqCst);
        state.keep_alive_live.store(false, Ordering::SeqCst);
        if let Some(task) = state.keep_alive_task.lock().take() {
            task.abort();
        }

        tracing::info!("Stopping background keep-alive");
        state.player.stop();
        state.release(LeaseRole::AudioKeepAlive);
    }
}

impl std::fmt::Debug for ContinuityLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuityLeaseManager")
            .field("leases", &*self.state.leases.lock())
            .field("keep_alive_running", &self.is_keep_alive_running())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
