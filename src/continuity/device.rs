//! Keep-Alive Player auf dem Standard-Ausgabegerät
//!
//! Verwendet cpal für Cross-Platform Audio Output. Der Stream ist nicht
//! `Send`, deshalb lebt er komplett auf einem eigenen Thread und wird dort
//! auch wieder gedroppt.

use super::player::KeepAlivePlayer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use thiserror::Error;

/// Bevorzugte Sample Rate
const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// PLAYER
// ============================================================================

struct PlayerWorker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    playing: Arc<AtomicBool>,
}

/// Spielt Stille auf dem Standard-Ausgabegerät
#[derive(Default)]
pub struct DeviceSilencePlayer {
    worker: Mutex<Option<PlayerWorker>>,
}

impl DeviceSilencePlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeepAlivePlayer for DeviceSilencePlayer {
    fn play(&self) {
        let mut worker = self.worker.lock();
        reap_failed_worker(&mut worker);
        if worker.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let playing = Arc::new(AtomicBool::new(false));
        let playing_flag = Arc::clone(&playing);

        let spawned = std::thread::Builder::new()
            .name("keep-alive-audio".to_string())
            .spawn(move || match open_silence_stream() {
                Ok(stream) => {
                    playing_flag.store(true, Ordering::SeqCst);
                    tracing::info!("Start playing keep-alive audio");
                    // Blockiert bis stop() aufgerufen oder der Player gedroppt wird
                    let _ = stop_rx.recv();
                    drop(stream);
                    playing_flag.store(false, Ordering::SeqCst);
                }
                Err(e) => tracing::warn!("Failed to start keep-alive audio: {}", e),
            });

        match spawned {
            Ok(thread) => {
                *worker = Some(PlayerWorker {
                    stop_tx,
                    thread,
                    playing,
                })
            }
            Err(e) => tracing::warn!("Failed to spawn keep-alive audio thread: {}", e),
        }
    }

    fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            tracing::info!("Stop playing keep-alive audio");
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
        }
    }

    fn is_playing(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| w.playing.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Räumt einen Worker ab, dessen Thread schon beendet ist (Stream konnte nicht geöffnet werden)
fn reap_failed_worker(worker: &mut Option<PlayerWorker>) {
    if worker.as_ref().is_some_and(|w| w.thread.is_finished()) {
        if let Some(failed) = worker.take() {
            let _ = failed.thread.join();
            tracing::debug!("Retrying keep-alive audio after failed start");
        }
    }
}

impl Drop for DeviceSilencePlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_silence_stream() -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    let config = select_f32_config(configs.collect())?;

    let stream = device
        .build_output_stream(
            &config,
            |data: &mut [f32], _: &cpal::OutputCallbackInfo| data.fill(0.0),
            |err| tracing::error!("Keep-alive audio error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok(stream)
}

/// Wählt eine F32 Konfiguration, bevorzugt 48kHz
fn select_f32_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32);

    let mut fallback: Option<StreamConfig> = None;
    for config in f32_configs {
        if config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
        fallback.get_or_insert_with(|| config.clone().with_max_sample_rate().into());
    }

    fallback.ok_or_else(|| {
        AudioError::UnsupportedConfig("No f32 output configuration available".to_string())
    })
}
