//! Blocking cycle loop — the record → play → record state machine.
//!
//! ## Per-iteration stages
//!
//! ```text
//! 1. Check running flag
//! 2. Drain playback lifecycle events (non-blocking)
//! 3. Drain one chunk from the capture ring (sleep briefly when empty)
//! 4. Re-read runtime settings into the analyzer and buffer
//! 5. Analyze → volume event broadcast
//! 6. State-machine step:
//!      Listening  — first voiced chunk starts Recording
//!      Recording  — chunks accumulate; sustained silence or a full buffer
//!                   hands the recording to the playback sink (Playing)
//!      Playing    — a voiced chunk interrupts playback and re-arms Listening
//! ```
//!
//! Capture is never stopped while playing: interruption works because chunks
//! keep flowing through the analyzer, and the one configured threshold both
//! starts recording and interrupts playback.
//!
//! The whole loop runs in `spawn_blocking`; chunks are processed strictly in
//! arrival order on this single thread, so no state needs a lock beyond the
//! shared snapshot mutex.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    analysis::SilenceAnalyzer,
    audio::playback::{PlaybackEvent, PlaybackSink},
    buffering::{chunk::AudioChunk, AudioConsumer, Consumer, RecordingBuffer},
    controller::CycleConfig,
    error::EchoError,
    ipc::events::{now_millis, CycleState, ErrorEvent, StateChangeEvent, VolumeEvent},
};

/// Chunk size drained from the ring per iteration.
/// 20 ms at 48 kHz = 960 samples; 60 ms at 16 kHz.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty (avoids busy-wait burning a core).
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

pub struct CycleDiagnostics {
    pub chunks_in: AtomicUsize,
    pub chunks_recorded: AtomicUsize,
    pub silence_events: AtomicUsize,
    pub playbacks_started: AtomicUsize,
    pub playbacks_completed: AtomicUsize,
    pub interruptions: AtomicUsize,
}

impl Default for CycleDiagnostics {
    fn default() -> Self {
        Self {
            chunks_in: AtomicUsize::new(0),
            chunks_recorded: AtomicUsize::new(0),
            silence_events: AtomicUsize::new(0),
            playbacks_started: AtomicUsize::new(0),
            playbacks_completed: AtomicUsize::new(0),
            interruptions: AtomicUsize::new(0),
        }
    }
}

impl CycleDiagnostics {
    pub fn reset(&self) {
        self.chunks_in.store(0, Ordering::Relaxed);
        self.chunks_recorded.store(0, Ordering::Relaxed);
        self.silence_events.store(0, Ordering::Relaxed);
        self.playbacks_started.store(0, Ordering::Relaxed);
        self.playbacks_completed.store(0, Ordering::Relaxed);
        self.interruptions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            chunks_recorded: self.chunks_recorded.load(Ordering::Relaxed),
            silence_events: self.silence_events.load(Ordering::Relaxed),
            playbacks_started: self.playbacks_started.load(Ordering::Relaxed),
            playbacks_completed: self.playbacks_completed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub chunks_recorded: usize,
    pub silence_events: usize,
    pub playbacks_started: usize,
    pub playbacks_completed: usize,
    pub interruptions: usize,
}

/// All context the cycle loop needs, passed as one struct so the
/// `spawn_blocking` closure stays tidy.
pub struct CycleContext {
    pub config: Arc<Mutex<CycleConfig>>,
    pub sink: Box<dyn PlaybackSink>,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    /// Canonical state snapshot shared with the controller handle.
    pub state: Arc<Mutex<CycleState>>,
    pub state_tx: broadcast::Sender<StateChangeEvent>,
    pub volume_tx: broadcast::Sender<VolumeEvent>,
    pub error_tx: broadcast::Sender<ErrorEvent>,
    /// Monotonically increasing state-event sequence counter.
    pub seq: Arc<AtomicU64>,
    pub capture_sample_rate: u32,
    pub diagnostics: Arc<CycleDiagnostics>,
}

/// Run the cycle loop until `ctx.running` becomes false or a failure lands
/// the machine in `Error`.
///
/// Entered with capture already open; emits the initial `ready → listening`
/// transition itself.
pub fn run(mut ctx: CycleContext) {
    info!(
        capture_sample_rate = ctx.capture_sample_rate,
        "cycle loop started"
    );

    let (threshold_db, silence_duration, max_secs) = {
        let cfg = ctx.config.lock();
        (
            cfg.volume_threshold_db,
            cfg.silence_duration,
            cfg.max_recording_secs,
        )
    };

    let mut analyzer = SilenceAnalyzer::new(threshold_db, silence_duration);
    let mut buffer = RecordingBuffer::new(max_secs);
    buffer.set_discard_leading_silence(true);

    let mut state = transition(&mut ctx, CycleState::Ready, CycleState::Listening, &buffer, false);

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut volume_seq = 0u64;

    'outer: loop {
        // ── 0. Check running flag ─────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        // ── 1. Playback lifecycle events ──────────────────────────────────
        while let Some(event) = ctx.sink.try_next_event() {
            match event {
                PlaybackEvent::Started { total_seconds } => {
                    debug!(total_seconds, "playback started");
                }
                PlaybackEvent::Ended { played_seconds } => {
                    ctx.diagnostics
                        .playbacks_completed
                        .fetch_add(1, Ordering::Relaxed);
                    if state == CycleState::Playing {
                        debug!(played_seconds, "playback finished — listening again");
                        rearm(&mut buffer, &mut analyzer);
                        state = transition(&mut ctx, state, CycleState::Listening, &buffer, false);
                    }
                }
                PlaybackEvent::Interrupted { played_seconds } => {
                    // The state already advanced when the stop was requested.
                    debug!(played_seconds, "playback interrupted");
                }
                PlaybackEvent::Failed { message } => {
                    fail(&mut ctx, &mut state, &buffer, EchoError::Playback(message));
                    break 'outer;
                }
            }
        }

        // ── 2. Drain ring buffer ──────────────────────────────────────────
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(SLEEP_EMPTY);
            continue;
        }
        ctx.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);

        // ── 3. Runtime settings ───────────────────────────────────────────
        {
            let cfg = ctx.config.lock();
            analyzer.update_settings(cfg.volume_threshold_db, cfg.silence_duration);
            buffer.set_max_duration_secs(cfg.max_recording_secs);
        }

        // ── 4. Analyze ────────────────────────────────────────────────────
        let chunk = AudioChunk::new(raw[..n].to_vec(), ctx.capture_sample_rate);
        let (result, silence) = analyzer.analyze(&chunk);

        let _ = ctx.volume_tx.send(VolumeEvent {
            seq: volume_seq,
            rms: result.rms,
            volume_db: result.volume_db,
            is_silent: result.is_silent,
            timestamp_ms: now_millis(),
        });
        volume_seq = volume_seq.saturating_add(1);

        // ── 5. State machine step ─────────────────────────────────────────
        match state {
            CycleState::Listening => {
                // The buffer's leading-silence mode drops silent chunks; the
                // first one it stores is the voice that starts the take.
                if buffer.add_chunk(chunk, result.is_silent) {
                    ctx.diagnostics
                        .chunks_recorded
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(volume_db = result.volume_db, "voice detected — recording");
                    state = transition(&mut ctx, state, CycleState::Recording, &buffer, false);
                }
            }

            CycleState::Recording => {
                if buffer.add_chunk(chunk, result.is_silent) {
                    ctx.diagnostics
                        .chunks_recorded
                        .fetch_add(1, Ordering::Relaxed);
                }
                if silence.is_some() {
                    ctx.diagnostics
                        .silence_events
                        .fetch_add(1, Ordering::Relaxed);
                }
                if buffer.is_full() {
                    warn!(
                        buffered_secs = buffer.duration_secs(),
                        "recording limit reached — forcing playback"
                    );
                }

                if (silence.is_some() || buffer.is_full()) && !buffer.is_empty() {
                    let samples = buffer.all_samples();
                    debug!(
                        samples = samples.len(),
                        buffered_secs = buffer.duration_secs(),
                        "take complete — starting playback"
                    );
                    match ctx.sink.play(samples, ctx.capture_sample_rate) {
                        Ok(()) => {
                            ctx.diagnostics
                                .playbacks_started
                                .fetch_add(1, Ordering::Relaxed);
                            state = transition(&mut ctx, state, CycleState::Playing, &buffer, true);
                        }
                        Err(e) => {
                            fail(&mut ctx, &mut state, &buffer, e);
                            break 'outer;
                        }
                    }
                }
            }

            CycleState::Playing => {
                if !result.is_silent {
                    info!(
                        volume_db = result.volume_db,
                        "speech during playback — interrupting"
                    );
                    ctx.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
                    ctx.sink.stop();
                    rearm(&mut buffer, &mut analyzer);
                    state = transition(&mut ctx, state, CycleState::Listening, &buffer, false);
                }
                // Silent chunks during playback only feed the volume meter.
            }

            // The loop is only ever entered in an active state.
            CycleState::Ready | CycleState::Error => break,
        }
    }

    // Teardown: abort any playback and land in Ready, unless a failure
    // already drove the machine to Error.
    ctx.sink.stop();
    buffer.clear();
    if state != CycleState::Error {
        transition(&mut ctx, state, CycleState::Ready, &buffer, false);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        chunks_in = snap.chunks_in,
        chunks_recorded = snap.chunks_recorded,
        silence_events = snap.silence_events,
        playbacks_started = snap.playbacks_started,
        playbacks_completed = snap.playbacks_completed,
        interruptions = snap.interruptions,
        "cycle loop stopped — diagnostics"
    );
}

/// Prepare for a fresh take: empty the buffer, re-arm leading-silence
/// suppression, and clear any stale silence run.
fn rearm(buffer: &mut RecordingBuffer, analyzer: &mut SilenceAnalyzer) {
    buffer.clear();
    buffer.set_discard_leading_silence(true);
    analyzer.reset();
}

fn transition(
    ctx: &mut CycleContext,
    from: CycleState,
    to: CycleState,
    buffer: &RecordingBuffer,
    is_playing: bool,
) -> CycleState {
    *ctx.state.lock() = to;
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.state_tx.send(StateChangeEvent {
        seq,
        old_state: from,
        new_state: to,
        timestamp_ms: now_millis(),
        buffer_duration_seconds: buffer.duration_secs(),
        buffer_sample_count: buffer.sample_count(),
        is_capturing: !matches!(to, CycleState::Ready | CycleState::Error),
        is_playing,
    });
    debug!(?from, ?to, "state transition");
    to
}

/// Convert a failure into the `Error` state: emit the error event, record the
/// transition, and stop the loop. Recovery requires an explicit reset.
fn fail(ctx: &mut CycleContext, state: &mut CycleState, buffer: &RecordingBuffer, err: EchoError) {
    error!(error = %err, "cycle failure");
    let _ = ctx.error_tx.send(ErrorEvent {
        kind: err.kind(),
        message: err.to_string(),
        timestamp_ms: now_millis(),
    });
    *state = transition(ctx, *state, CycleState::Error, buffer, false);
    ctx.running.store(false, Ordering::SeqCst);
}
