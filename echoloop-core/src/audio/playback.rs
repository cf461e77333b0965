//! Interruptible playback through a cpal output device.
//!
//! # Design constraints
//!
//! `cpal::Stream` is `!Send` on Windows/macOS, but the cycle loop that
//! decides when to start and stop playback runs on a `spawn_blocking` thread
//! and must hold a `Send` handle. [`CpalPlayback`] therefore spawns one
//! dedicated worker thread that owns every output stream for the life of the
//! sink; the handle talks to it over crossbeam channels and is freely `Send`.
//!
//! # Lifecycle contract
//!
//! Exactly one of `Ended` or `Interrupted` is emitted per playback session —
//! unless the device fails before the stream starts, which yields `Failed`
//! instead. Starting a new session implicitly interrupts the previous one,
//! and stopping while idle is a no-op.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::Result;

#[cfg(feature = "audio-cpal")]
use crate::error::EchoError;

/// Lifecycle notifications from the playback sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The stream opened and playback began.
    Started { total_seconds: f64 },
    /// The clip ran to its natural end.
    Ended { played_seconds: f64 },
    /// Playback was force-stopped before the end of the clip.
    Interrupted { played_seconds: f64 },
    /// The sink could not be engaged or died mid-playback.
    Failed { message: String },
}

/// Capability seam for audio output.
///
/// The cycle loop only ever talks to this trait, so tests drive the state
/// machine with scripted fakes instead of a live audio device.
pub trait PlaybackSink: Send + 'static {
    /// Begin playing `samples` at `sample_rate`, force-stopping any active
    /// playback first.
    ///
    /// Device failures are reported asynchronously as a
    /// [`PlaybackEvent::Failed`]; an `Err` here means the sink itself is
    /// gone (worker thread dead).
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<()>;

    /// Force-stop the active session, if any. Idempotent.
    fn stop(&mut self);

    /// Drain the next pending lifecycle event without blocking.
    fn try_next_event(&mut self) -> Option<PlaybackEvent>;
}

enum SinkCommand {
    Play { samples: Vec<f32>, sample_rate: u32 },
    Stop,
}

/// Progress view of one playback session, split from the stream-owning type
/// so the worker protocol runs against fakes in tests.
trait Session {
    fn total_seconds(&self) -> f64;
    fn played_seconds(&self) -> f64;
    fn is_finished(&self) -> bool;
}

/// cpal-backed [`PlaybackSink`].
pub struct CpalPlayback {
    cmd_tx: Option<Sender<SinkCommand>>,
    event_rx: Receiver<PlaybackEvent>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalPlayback {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let worker = std::thread::Builder::new()
            .name("echoloop-playback".into())
            .spawn(move || worker_loop(cmd_rx, event_tx, ActiveSession::start))
            .ok();
        if worker.is_none() {
            warn!("failed to spawn playback worker thread");
        }

        Self {
            cmd_tx: Some(cmd_tx),
            event_rx,
            worker,
        }
    }
}

impl Default for CpalPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for CpalPlayback {
    fn play(&mut self, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        let Some(tx) = self.cmd_tx.as_ref() else {
            return Err(crate::error::EchoError::Playback(
                "playback worker is shut down".into(),
            ));
        };
        tx.send(SinkCommand::Play {
            samples,
            sample_rate,
        })
        .map_err(|_| crate::error::EchoError::Playback("playback worker died".into()))
    }

    fn stop(&mut self) {
        if let Some(tx) = self.cmd_tx.as_ref() {
            let _ = tx.send(SinkCommand::Stop);
        }
    }

    fn try_next_event(&mut self) -> Option<PlaybackEvent> {
        self.event_rx.try_recv().ok()
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        // Disconnecting the command channel makes the worker interrupt any
        // active session and exit.
        self.cmd_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// How often the worker polls an active session for natural completion.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

fn worker_loop<S: Session>(
    cmd_rx: Receiver<SinkCommand>,
    event_tx: Sender<PlaybackEvent>,
    start_session: impl Fn(Vec<f32>, u32) -> Result<S>,
) {
    let mut active: Option<S> = None;

    loop {
        let cmd = if active.is_some() {
            match cmd_rx.recv_timeout(POLL_INTERVAL) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    finish_session(&mut active, &event_tx);
                    return;
                }
            }
        } else {
            match cmd_rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => return,
            }
        };

        match cmd {
            Some(SinkCommand::Play {
                samples,
                sample_rate,
            }) => {
                // Exclusive playback: a new session displaces the old one.
                finish_session(&mut active, &event_tx);
                match start_session(samples, sample_rate) {
                    Ok(session) => {
                        info!(
                            total_seconds = session.total_seconds(),
                            "playback session started"
                        );
                        let _ = event_tx.send(PlaybackEvent::Started {
                            total_seconds: session.total_seconds(),
                        });
                        active = Some(session);
                    }
                    Err(e) => {
                        warn!("failed to start playback: {e}");
                        let _ = event_tx.send(PlaybackEvent::Failed {
                            message: e.to_string(),
                        });
                    }
                }
            }
            Some(SinkCommand::Stop) => finish_session(&mut active, &event_tx),
            None => {
                // Poll for natural completion.
                if active.as_ref().is_some_and(S::is_finished) {
                    finish_session(&mut active, &event_tx);
                }
            }
        }
    }
}

/// Tear down the active session, emitting `Ended` when the clip ran out on
/// its own and `Interrupted` otherwise. No-op when idle.
fn finish_session<S: Session>(active: &mut Option<S>, event_tx: &Sender<PlaybackEvent>) {
    let Some(session) = active.take() else {
        return;
    };
    let finished = session.is_finished();
    let played_seconds = session.played_seconds();
    drop(session);

    let event = if finished {
        debug!(played_seconds, "playback ran to completion");
        PlaybackEvent::Ended { played_seconds }
    } else {
        debug!(played_seconds, "playback interrupted");
        PlaybackEvent::Interrupted { played_seconds }
    };
    let _ = event_tx.send(event);
}

#[cfg(feature = "audio-cpal")]
mod session {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        SampleFormat, SampleRate, StreamConfig,
    };
    use tracing::info;

    use super::{EchoError, Result, Session};
    use crate::audio::resample;

    /// One playback session: a live output stream plus shared progress state.
    pub struct ActiveSession {
        /// Kept alive so the stream is not dropped prematurely.
        _stream: cpal::Stream,
        /// Next clip sample the output callback will emit.
        cursor: Arc<AtomicUsize>,
        /// Raised by the callback once the clip is exhausted.
        done: Arc<AtomicBool>,
        clip_len: usize,
        device_rate: u32,
    }

    impl ActiveSession {
        pub fn start(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(EchoError::NoDefaultOutputDevice)?;

            let supported = device
                .default_output_config()
                .map_err(|e| EchoError::AudioDevice(e.to_string()))?;
            let device_rate = supported.sample_rate().0;
            let channels = supported.channels();

            // Match the clip to the device's native rate up front; the
            // callback then only copies samples.
            let clip: Arc<Vec<f32>> = if device_rate == sample_rate {
                Arc::new(samples)
            } else {
                info!(
                    from = sample_rate,
                    to = device_rate,
                    "resampling recording for output device"
                );
                Arc::new(resample::convert_clip(sample_rate, device_rate, &samples)?)
            };
            let clip_len = clip.len();

            let cursor = Arc::new(AtomicUsize::new(0));
            let done = Arc::new(AtomicBool::new(clip_len == 0));

            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(device_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let ch = channels as usize;
            let stream = match supported.sample_format() {
                SampleFormat::F32 => {
                    let clip = Arc::clone(&clip);
                    let cursor_cb = Arc::clone(&cursor);
                    let done_cb = Arc::clone(&done);
                    device.build_output_stream(
                        &config,
                        move |data: &mut [f32], _info| {
                            for frame in data.chunks_mut(ch) {
                                let pos = cursor_cb.load(Ordering::Relaxed);
                                if pos >= clip.len() {
                                    done_cb.store(true, Ordering::Release);
                                    frame.fill(0.0);
                                    continue;
                                }
                                frame.fill(clip[pos]);
                                cursor_cb.store(pos + 1, Ordering::Relaxed);
                            }
                        },
                        |err| tracing::error!("playback stream error: {err}"),
                        None,
                    )
                }

                SampleFormat::I16 => {
                    let clip = Arc::clone(&clip);
                    let cursor_cb = Arc::clone(&cursor);
                    let done_cb = Arc::clone(&done);
                    device.build_output_stream(
                        &config,
                        move |data: &mut [i16], _info| {
                            for frame in data.chunks_mut(ch) {
                                let pos = cursor_cb.load(Ordering::Relaxed);
                                if pos >= clip.len() {
                                    done_cb.store(true, Ordering::Release);
                                    frame.fill(0);
                                    continue;
                                }
                                let value =
                                    (clip[pos].clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                                frame.fill(value);
                                cursor_cb.store(pos + 1, Ordering::Relaxed);
                            }
                        },
                        |err| tracing::error!("playback stream error: {err}"),
                        None,
                    )
                }

                fmt => {
                    return Err(EchoError::Playback(format!(
                        "unsupported output sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| EchoError::Playback(e.to_string()))?;

            stream
                .play()
                .map_err(|e| EchoError::Playback(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                cursor,
                done,
                clip_len,
                device_rate,
            })
        }
    }

    impl Session for ActiveSession {
        fn total_seconds(&self) -> f64 {
            self.clip_len as f64 / self.device_rate as f64
        }

        fn played_seconds(&self) -> f64 {
            let played = self.cursor.load(Ordering::Relaxed).min(self.clip_len);
            played as f64 / self.device_rate as f64
        }

        fn is_finished(&self) -> bool {
            self.done.load(Ordering::Acquire)
        }
    }
}

#[cfg(feature = "audio-cpal")]
use session::ActiveSession;

/// Stub session when the `audio-cpal` feature is disabled: every play attempt
/// fails, keeping the worker protocol intact.
#[cfg(not(feature = "audio-cpal"))]
struct ActiveSession;

#[cfg(not(feature = "audio-cpal"))]
impl ActiveSession {
    fn start(_samples: Vec<f32>, _sample_rate: u32) -> Result<Self> {
        Err(crate::error::EchoError::Playback(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl Session for ActiveSession {
    fn total_seconds(&self) -> f64 {
        0.0
    }

    fn played_seconds(&self) -> f64 {
        0.0
    }

    fn is_finished(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::error::EchoError;

    /// Session fake whose natural completion the test flips externally.
    struct FakeSession {
        total: f64,
        done: Arc<AtomicBool>,
    }

    impl Session for FakeSession {
        fn total_seconds(&self) -> f64 {
            self.total
        }

        fn played_seconds(&self) -> f64 {
            if self.is_finished() {
                self.total
            } else {
                0.0
            }
        }

        fn is_finished(&self) -> bool {
            self.done.load(Ordering::Acquire)
        }
    }

    struct Worker {
        cmd_tx: Sender<SinkCommand>,
        event_rx: Receiver<PlaybackEvent>,
        /// Done flags of the sessions the factory created, in start order.
        sessions: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_worker(fail_start: bool) -> Worker {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let sessions: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::clone(&sessions);

        let handle = thread::spawn(move || {
            worker_loop(cmd_rx, event_tx, move |samples: Vec<f32>, sample_rate| {
                if fail_start {
                    return Err(EchoError::Playback("no output device".into()));
                }
                let done = Arc::new(AtomicBool::new(false));
                created.lock().push(Arc::clone(&done));
                Ok(FakeSession {
                    total: samples.len() as f64 / sample_rate as f64,
                    done,
                })
            })
        });

        Worker {
            cmd_tx,
            event_rx,
            sessions,
            handle,
        }
    }

    fn play(w: &Worker, samples: usize) {
        w.cmd_tx
            .send(SinkCommand::Play {
                samples: vec![0.1; samples],
                sample_rate: 16_000,
            })
            .expect("worker alive");
    }

    fn recv_event(w: &Worker) -> PlaybackEvent {
        w.event_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("timed out waiting for playback event")
    }

    fn assert_no_event(w: &Worker, window: Duration) {
        match w.event_rx.recv_timeout(window) {
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            Ok(ev) => panic!("expected no event, got {ev:?}"),
        }
    }

    fn shutdown(w: Worker) {
        drop(w.cmd_tx);
        w.handle.join().expect("playback worker panicked");
    }

    #[test]
    fn natural_end_emits_exactly_one_ended() {
        let w = spawn_worker(false);
        play(&w, 16_000);

        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Started { total_seconds: 1.0 }
        );

        // The clip runs out: one Ended, then nothing else for this session.
        w.sessions.lock()[0].store(true, Ordering::Release);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Ended { played_seconds: 1.0 }
        );
        assert_no_event(&w, Duration::from_millis(60));

        // A stop after the session already ended is a no-op.
        w.cmd_tx.send(SinkCommand::Stop).unwrap();
        assert_no_event(&w, Duration::from_millis(60));

        shutdown(w);
    }

    #[test]
    fn stop_emits_exactly_one_interrupted() {
        let w = spawn_worker(false);
        play(&w, 16_000);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Started { total_seconds: 1.0 }
        );

        w.cmd_tx.send(SinkCommand::Stop).unwrap();
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Interrupted { played_seconds: 0.0 }
        );

        // Finishing after the interrupt must not produce a second terminal
        // event: the session is already torn down.
        w.sessions.lock()[0].store(true, Ordering::Release);
        assert_no_event(&w, Duration::from_millis(60));

        shutdown(w);
    }

    #[test]
    fn new_play_displaces_the_active_session() {
        let w = spawn_worker(false);
        play(&w, 16_000);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Started { total_seconds: 1.0 }
        );

        // Second play: the first session is interrupted before the second
        // starts, in that order.
        play(&w, 32_000);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Interrupted { played_seconds: 0.0 }
        );
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Started { total_seconds: 2.0 }
        );

        w.sessions.lock()[1].store(true, Ordering::Release);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Ended { played_seconds: 2.0 }
        );
        assert_no_event(&w, Duration::from_millis(60));

        shutdown(w);
    }

    #[test]
    fn stop_while_idle_emits_nothing() {
        let w = spawn_worker(false);
        w.cmd_tx.send(SinkCommand::Stop).unwrap();
        assert_no_event(&w, Duration::from_millis(60));
        shutdown(w);
    }

    #[test]
    fn failed_start_emits_failed_and_no_terminal_event() {
        let w = spawn_worker(true);
        play(&w, 16_000);

        match recv_event(&w) {
            PlaybackEvent::Failed { message } => assert!(message.contains("no output device")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_no_event(&w, Duration::from_millis(60));

        shutdown(w);
    }

    #[test]
    fn disconnect_teardown_interrupts_the_active_session() {
        let w = spawn_worker(false);
        play(&w, 16_000);
        assert_eq!(
            recv_event(&w),
            PlaybackEvent::Started { total_seconds: 1.0 }
        );

        let Worker {
            cmd_tx,
            event_rx,
            handle,
            ..
        } = w;
        drop(cmd_tx);
        handle.join().expect("playback worker panicked");

        assert_eq!(
            event_rx.recv().expect("terminal event before exit"),
            PlaybackEvent::Interrupted { played_seconds: 0.0 }
        );
        assert!(event_rx.recv().is_err());
    }
}
