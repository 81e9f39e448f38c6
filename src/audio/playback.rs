//! Gapless playback of incoming speech
//!
//! `PlaybackScheduler` owns the playback cursor and the set of scheduled
//! chunks. It is driven by a single actor task (`spawn_playback`) so the
//! network receive path and the animation loop never touch the cursor
//! directly: they talk to it through a `PlaybackHandle`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backend::{AudioFrame, OutputSink};
use super::capture::{pcm16_to_float, resample_nearest, rms};
use super::level::LevelMeter;
use crate::error::PlaybackError;

/// Samples inspected under the playhead for the output level
const LEVEL_WINDOW: usize = 512;
/// Weight of the previous level in the exponential smoothing
const LEVEL_SMOOTHING: f32 = 0.8;

/// Position of one scheduled chunk on the output clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSpan {
    pub id: u64,
    pub start_at: f64,
    pub end_at: f64,
}

impl ChunkSpan {
    pub fn duration(&self) -> f64 {
        self.end_at - self.start_at
    }
}

/// A chunk handed to the sink and not yet finished
struct ScheduledChunk {
    span: ChunkSpan,
    samples: Arc<[f32]>,
}

/// Schedules decoded chunks back to back on an output sink
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    sample_rate: u32,
    cursor: f64,
    chunks: VecDeque<ScheduledChunk>,
    next_id: u64,
    level: f32,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>, sample_rate: u32) -> Self {
        let cursor = sink.now();

        Self {
            sink,
            sample_rate,
            cursor,
            chunks: VecDeque::new(),
            next_id: 0,
            level: 0.0,
        }
    }

    /// Decode a frame and schedule it at `max(now, cursor)`
    ///
    /// Returns `None` for an empty frame.
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Option<ChunkSpan>, PlaybackError> {
        let now = self.sink.now();
        self.reap(now);

        let mut samples = pcm16_to_float(&frame.pcm16());
        if frame.sample_rate != self.sample_rate {
            warn!(
                "Frame {} arrived at {}Hz, resampling to {}Hz",
                frame.sequence, frame.sample_rate, self.sample_rate
            );
            samples = resample_nearest(&samples, frame.sample_rate, self.sample_rate);
        }

        let samples: Arc<[f32]> = samples.into();
        if samples.is_empty() {
            return Ok(None);
        }

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start_at = self.cursor.max(now);

        let id = self.next_id;
        self.next_id += 1;

        self.sink.schedule(id, Arc::clone(&samples), start_at)?;
        self.cursor = start_at + duration;

        let span = ChunkSpan {
            id,
            start_at,
            end_at: self.cursor,
        };
        self.chunks.push_back(ScheduledChunk { span, samples });

        debug!(
            "Scheduled frame {} as chunk {}: {:.3}s - {:.3}s",
            frame.sequence, id, span.start_at, span.end_at
        );

        Ok(Some(span))
    }

    /// Cancel everything not yet played and reset the cursor to now
    ///
    /// Returns the number of chunks cancelled.
    pub fn flush(&mut self) -> usize {
        let now = self.sink.now();
        self.reap(now);

        let cancelled = self.chunks.len();
        for chunk in self.chunks.drain(..) {
            self.sink.cancel(chunk.span.id);
        }

        self.cursor = now;
        self.level = 0.0;

        cancelled
    }

    /// Smoothed magnitude of the audio currently under the playhead
    pub fn sample_level(&mut self) -> f32 {
        let now = self.sink.now();
        self.reap(now);

        let raw = self
            .chunks
            .iter()
            .find(|c| c.span.start_at <= now && now < c.span.end_at)
            .map(|c| {
                let offset = ((now - c.span.start_at) * self.sample_rate as f64) as usize;
                let offset = offset.min(c.samples.len());
                let end = (offset + LEVEL_WINDOW).min(c.samples.len());
                rms(&c.samples[offset..end])
            })
            .unwrap_or(0.0);

        self.level = (LEVEL_SMOOTHING * self.level + (1.0 - LEVEL_SMOOTHING) * raw).clamp(0.0, 1.0);
        self.level
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Chunks scheduled and not yet finished
    pub fn pending(&self) -> Vec<ChunkSpan> {
        self.chunks.iter().map(|c| c.span).collect()
    }

    pub async fn close(&mut self) {
        self.flush();
        self.sink.close().await;
    }

    /// Drop chunks whose playback has completed
    fn reap(&mut self, now: f64) {
        while let Some(chunk) = self.chunks.front() {
            if chunk.span.end_at <= now {
                self.chunks.pop_front();
            } else {
                break;
            }
        }
    }
}

enum PlaybackCommand {
    Enqueue(AudioFrame),
    Flush,
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the playback actor
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
    level: Arc<LevelMeter>,
}

impl PlaybackHandle {
    pub fn enqueue(&self, frame: AudioFrame) -> Result<(), PlaybackError> {
        self.tx
            .send(PlaybackCommand::Enqueue(frame))
            .map_err(|_| PlaybackError::Closed)
    }

    /// Barge-in: drop everything scheduled so far
    pub fn flush(&self) {
        if self.tx.send(PlaybackCommand::Flush).is_err() {
            debug!("Flush ignored: playback already stopped");
        }
    }

    /// Latest smoothed output level, never blocks
    pub fn output_level(&self) -> f32 {
        self.level.load()
    }

    /// Flush, release the sink and wait for the actor to exit
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PlaybackCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Run a scheduler on its own task
///
/// The output level is refreshed every `level_interval` into `level`.
pub fn spawn_playback(
    mut scheduler: PlaybackScheduler,
    level: Arc<LevelMeter>,
    level_interval: Duration,
) -> (PlaybackHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = PlaybackHandle {
        tx,
        level: Arc::clone(&level),
    };

    let task = tokio::spawn(async move {
        info!("Playback task started");

        let mut ticker = tokio::time::interval(level_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PlaybackCommand::Enqueue(frame)) => {
                        if let Err(e) = scheduler.enqueue(&frame) {
                            warn!("Failed to schedule frame {}: {}", frame.sequence, e);
                        }
                    }
                    Some(PlaybackCommand::Flush) => {
                        let cancelled = scheduler.flush();
                        level.store(0.0);
                        info!("Playback flushed ({} chunks cancelled)", cancelled);
                    }
                    Some(PlaybackCommand::Shutdown(done)) => {
                        scheduler.close().await;
                        level.store(0.0);
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        scheduler.close().await;
                        level.store(0.0);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    level.store(scheduler.sample_level());
                }
            }
        }

        info!("Playback task stopped");
    });

    (handle, task)
}
