//! `CycleController` — top-level lifecycle handle.
//!
//! ## Lifecycle
//!
//! ```text
//! CycleController::new()
//!     └─► start()        → mic open, cycle loop spawned, state = Listening
//!         └─► stop()     → running=false, loop tears down, state = Ready
//!             └─► start() again, indefinitely
//!
//! any failure            → state = Error (loop exits)
//!     └─► reset()        → error cleared, state = Ready
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, so the microphone is opened
//! *inside* the `spawn_blocking` closure and never crosses a thread boundary;
//! the playback sink's own worker thread hides the same constraint on the
//! output side. A sync mpsc channel propagates device-open errors back to the
//! `start()` caller.

pub mod cycle;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    analysis::{DEFAULT_SILENCE_DURATION, DEFAULT_VOLUME_THRESHOLD_DB},
    audio::{
        playback::{CpalPlayback, PlaybackSink},
        AudioCapture,
    },
    buffering::{create_audio_ring, recording::DEFAULT_MAX_DURATION_SECS},
    error::{EchoError, Result},
    ipc::events::{now_millis, CycleState, ErrorEvent, StateChangeEvent, VolumeEvent},
};

/// Broadcast channel capacity per event stream.
const BROADCAST_CAP: usize = 256;

/// Clamp bounds applied to [`SettingsUpdate`] values.
const VOLUME_THRESHOLD_MIN_DB: f32 = -70.0;
const VOLUME_THRESHOLD_MAX_DB: f32 = -20.0;
const SILENCE_DURATION_MIN_MS: u64 = 100;
const SILENCE_DURATION_MAX_MS: u64 = 2_000;

/// Runtime configuration for the cycle.
///
/// Shared with the running loop behind a mutex, so changes through
/// [`CycleController::update_settings`] apply to subsequent chunks without
/// restarting anything.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Chunks below this dB level are classified silent. Default: −50.
    pub volume_threshold_db: f32,
    /// Sustained silence needed to close a take and start playback.
    /// Default: 500 ms.
    pub silence_duration: Duration,
    /// Cap on buffered audio; older chunks are evicted past it and reaching
    /// it forces playback. Default: 300 s.
    pub max_recording_secs: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            volume_threshold_db: DEFAULT_VOLUME_THRESHOLD_DB,
            silence_duration: DEFAULT_SILENCE_DURATION,
            max_recording_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

/// Partial settings update from the UI. Absent fields are left unchanged;
/// out-of-range values are clamped rather than rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub volume_threshold_db: Option<f32>,
    pub silence_duration_ms: Option<u64>,
}

/// The top-level controller handle.
///
/// `CycleController` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<CycleController>` to share between the host app's state and
/// event-forwarding tasks.
pub struct CycleController {
    config: Arc<Mutex<CycleConfig>>,
    /// `true` while capture + cycle loop are active.
    running: Arc<AtomicBool>,
    /// Canonical state snapshot (also written by the loop).
    state: Arc<Mutex<CycleState>>,
    state_tx: broadcast::Sender<StateChangeEvent>,
    volume_tx: broadcast::Sender<VolumeEvent>,
    error_tx: broadcast::Sender<ErrorEvent>,
    /// Monotonically increasing state-event sequence counter.
    seq: Arc<AtomicU64>,
    diagnostics: Arc<cycle::CycleDiagnostics>,
}

impl CycleController {
    /// Create a new controller in the `Ready` state. Does not touch any
    /// audio device — call `start()` for that.
    pub fn new(config: CycleConfig) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (volume_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (error_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config: Arc::new(Mutex::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(CycleState::Ready)),
            state_tx,
            volume_tx,
            error_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(cycle::CycleDiagnostics::default()),
        }
    }

    /// Open the microphone and start the listen → record → play cycle.
    ///
    /// Blocks until the capture device is confirmed open (or failed), then
    /// returns; the cycle keeps running on a background blocking thread.
    ///
    /// # Errors
    /// - `EchoError::AlreadyRunning` if already started.
    /// - `EchoError::InvalidState` while in `Error` — `reset()` first.
    /// - `EchoError::NoDefaultInputDevice` / `EchoError::AudioDevice` /
    ///   `EchoError::AudioStream` on device failure; the controller lands in
    ///   `Error` and emits an error event.
    pub fn start(&self) -> Result<()> {
        if *self.state.lock() == CycleState::Error {
            return Err(EchoError::InvalidState("reset required after an error"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EchoError::AlreadyRunning);
        }

        self.diagnostics.reset();

        let (producer, consumer) = create_audio_ring();

        // Clone all shared state before moving into the closure.
        let config = Arc::clone(&self.config);
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let state_tx = self.state_tx.clone();
        let volume_tx = self.volume_tx.clone();
        let error_tx = self.error_tx.clone();
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: the loop thread signals device-open success/failure.
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            // Open the mic on THIS thread — cpal streams are thread-affine.
            let capture = match AudioCapture::open_default(producer, Arc::clone(&running)) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };
            let capture_sample_rate = capture.sample_rate;

            let sink: Box<dyn PlaybackSink> = Box::new(CpalPlayback::new());

            cycle::run(cycle::CycleContext {
                config,
                sink,
                consumer,
                running,
                state,
                state_tx,
                volume_tx,
                error_tx,
                seq,
                capture_sample_rate,
                diagnostics,
            });

            // Stream drops here, releasing the mic on the thread that owns it.
            drop(capture);
        });

        match open_rx.recv() {
            Ok(Ok(_rate)) => {
                info!("cycle controller started — listening");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.enter_error(&e);
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent — the blocking
                // task died before opening the device.
                self.running.store(false, Ordering::SeqCst);
                let e = EchoError::Other(anyhow::anyhow!("cycle task died unexpectedly"));
                self.enter_error(&e);
                Err(e)
            }
        }
    }

    /// Stop the cycle from any running state.
    ///
    /// The loop tears down on its next iteration: playback is aborted, the
    /// buffer cleared, and the state lands in `Ready`. An existing `Error`
    /// state is left alone — that needs `reset()`.
    ///
    /// # Errors
    /// - `EchoError::NotRunning` if nothing is active.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(EchoError::NotRunning);
        }
        info!("cycle controller stop requested");
        Ok(())
    }

    /// Clear the `Error` state back to `Ready` so `start()` works again.
    ///
    /// # Errors
    /// - `EchoError::InvalidState` when not in `Error`.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != CycleState::Error {
            return Err(EchoError::InvalidState("reset is only valid in the error state"));
        }
        *state = CycleState::Ready;
        drop(state);

        let _ = self.state_tx.send(StateChangeEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            old_state: CycleState::Error,
            new_state: CycleState::Ready,
            timestamp_ms: now_millis(),
            buffer_duration_seconds: 0.0,
            buffer_sample_count: 0,
            is_capturing: false,
            is_playing: false,
        });
        info!("error cleared — controller ready");
        Ok(())
    }

    /// Apply a partial settings update, clamping out-of-range values.
    ///
    /// Takes effect on the next processed chunk; the current state, buffer
    /// contents, and any in-flight silence run are untouched.
    pub fn update_settings(&self, update: SettingsUpdate) {
        let mut cfg = self.config.lock();
        if let Some(db) = update.volume_threshold_db {
            cfg.volume_threshold_db = db.clamp(VOLUME_THRESHOLD_MIN_DB, VOLUME_THRESHOLD_MAX_DB);
        }
        if let Some(ms) = update.silence_duration_ms {
            let ms = ms.clamp(SILENCE_DURATION_MIN_MS, SILENCE_DURATION_MAX_MS);
            cfg.silence_duration = Duration::from_millis(ms);
        }
        info!(
            volume_threshold_db = cfg.volume_threshold_db,
            silence_duration_ms = cfg.silence_duration.as_millis() as u64,
            "settings updated"
        );
    }

    /// Current state (snapshot).
    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    /// Current configuration (snapshot).
    pub fn config(&self) -> CycleConfig {
        self.config.lock().clone()
    }

    /// Subscribe to state-transition events.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.state_tx.subscribe()
    }

    /// Subscribe to per-chunk volume events (live level meter).
    pub fn subscribe_volume(&self) -> broadcast::Receiver<VolumeEvent> {
        self.volume_tx.subscribe()
    }

    /// Subscribe to error events.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.error_tx.subscribe()
    }

    /// Snapshot of cycle counters for observability.
    pub fn diagnostics_snapshot(&self) -> cycle::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn enter_error(&self, error: &EchoError) {
        let old = {
            let mut state = self.state.lock();
            let old = *state;
            *state = CycleState::Error;
            old
        };
        let _ = self.error_tx.send(ErrorEvent {
            kind: error.kind(),
            message: error.to_string(),
            timestamp_ms: now_millis(),
        });
        let _ = self.state_tx.send(StateChangeEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            old_state: old,
            new_state: CycleState::Error,
            timestamp_ms: now_millis(),
            buffer_duration_seconds: 0.0,
            buffer_sample_count: 0,
            is_capturing: false,
            is_playing: false,
        });
    }
}

impl Default for CycleController {
    fn default() -> Self {
        Self::new(CycleConfig::default())
    }
}
