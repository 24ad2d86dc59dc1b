//! Parallel body video decoder
//!
//! Clips are decoded on a bounded pool of host tasks. Workers push decoded
//! images into a channel; the owner drains it in `poll_frames` on the render
//! thread, so frame delivery is serialized with everything else the tick
//! does. A task removed from the registry (abort, park, resync, failure)
//! can never reach the callback: its late results fail the generation check
//! and are dropped, which releases their surfaces.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marionette_core::{
    AvatarError, AvatarResult, DescriptorId, FrameIndex, ObservabilityContext, StreamKind,
    TelemetryEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::body::{BodyFrame, BodyFrameDescriptor, SurfaceHandle};
use crate::spawn::TaskSpawner;

/// Decoder pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Maximum concurrently decoding clips
    pub workers: usize,
    /// A task producing no frame for this long is failed
    pub frame_timeout_ms: u64,
    /// Retries per clip after a failure
    pub max_retries: u32,
    /// How far past the playhead a queued clip may start decoding
    pub lookahead_frames: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            workers: 4,
            frame_timeout_ms: 3000,
            max_retries: 1,
            lookahead_frames: 48,
        }
    }
}

impl DecoderConfig {
    /// Fewer workers and a shorter window for low-end hosts
    pub fn constrained() -> Self {
        DecoderConfig {
            workers: 2,
            frame_timeout_ms: 5000,
            max_retries: 1,
            lookahead_frames: 24,
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// A decoded image, not yet attached to a clip
#[derive(Debug)]
pub struct DecodedImage {
    pub frame_index: FrameIndex,
    pub surface: SurfaceHandle,
}

/// Open decode session over one clip
pub trait DecodeStream: Send {
    /// Next image in frame order; `None` once the clip is exhausted
    fn next_image(&mut self) -> AvatarResult<Option<DecodedImage>>;

    /// Release codec resources early
    fn cancel(&mut self);
}

/// Codec capability for body video
pub trait BodyDecoder: Send + Sync {
    /// Open `descriptor` for decoding starting at `from`
    fn open(
        &self,
        descriptor: &BodyFrameDescriptor,
        from: FrameIndex,
    ) -> AvatarResult<Box<dyn DecodeStream>>;
}

enum WorkerMessage {
    Frame {
        clip: DescriptorId,
        generation: u64,
        image: DecodedImage,
    },
    Finished {
        clip: DescriptorId,
        generation: u64,
    },
    Failed {
        clip: DescriptorId,
        generation: u64,
        reason: String,
    },
}

/// Work running on a spawned task
struct DecodeTask {
    decoder: Arc<dyn BodyDecoder>,
    descriptor: BodyFrameDescriptor,
    generation: u64,
    cancel: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl DecodeTask {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn send(&self, msg: WorkerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    fn fail(&self, reason: String) {
        self.send(WorkerMessage::Failed {
            clip: self.descriptor.id,
            generation: self.generation,
            reason,
        });
    }

    fn run(self) {
        if self.cancelled() {
            return;
        }
        let clip = self.descriptor.id;
        let generation = self.generation;

        let mut stream = match self.decoder.open(&self.descriptor, self.descriptor.start_frame) {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        loop {
            if self.cancelled() {
                stream.cancel();
                return;
            }
            match stream.next_image() {
                Ok(Some(image)) => {
                    let sent = self.send(WorkerMessage::Frame {
                        clip,
                        generation,
                        image,
                    });
                    if !sent {
                        stream.cancel();
                        return;
                    }
                }
                Ok(None) => {
                    self.send(WorkerMessage::Finished { clip, generation });
                    return;
                }
                Err(e) => {
                    stream.cancel();
                    self.fail(e.to_string());
                    return;
                }
            }
        }
    }
}

struct Pending {
    descriptor: BodyFrameDescriptor,
    attempts: u32,
}

/// Registry entry for a running task
struct InFlight {
    descriptor: BodyFrameDescriptor,
    generation: u64,
    cancel: Arc<AtomicBool>,
    attempts: u32,
    opened_at: Instant,
    last_progress: Instant,
    /// First frame not yet delivered
    next_frame: FrameIndex,
    delivered: u64,
}

impl InFlight {
    fn abandon(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Undelivered part of the clip
    fn remainder(&self) -> Option<Pending> {
        self.descriptor.trimmed_from(self.next_frame).map(|descriptor| Pending {
            descriptor,
            attempts: self.attempts,
        })
    }
}

/// Bounded pool of body clip decoders
pub struct ParallelDecoder {
    config: DecoderConfig,
    decoder: Arc<dyn BodyDecoder>,
    spawner: Arc<dyn TaskSpawner>,
    queue: VecDeque<Pending>,
    registry: HashMap<DescriptorId, InFlight>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    next_generation: u64,
    last_resync: Option<FrameIndex>,
    obs: ObservabilityContext,
}

impl ParallelDecoder {
    pub fn new(decoder: Arc<dyn BodyDecoder>, spawner: Arc<dyn TaskSpawner>) -> Self {
        Self::with_config(
            DecoderConfig::default(),
            decoder,
            spawner,
            ObservabilityContext::default(),
        )
    }

    pub fn with_config(
        config: DecoderConfig,
        decoder: Arc<dyn BodyDecoder>,
        spawner: Arc<dyn TaskSpawner>,
        obs: ObservabilityContext,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ParallelDecoder {
            config,
            decoder,
            spawner,
            queue: VecDeque::new(),
            registry: HashMap::new(),
            tx,
            rx,
            next_generation: 0,
            last_resync: None,
            obs,
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Whether a clip is queued or decoding
    pub fn contains(&self, clip: DescriptorId) -> bool {
        self.registry.contains_key(&clip) || self.queue.iter().any(|p| p.descriptor.id == clip)
    }

    /// Append clips to the FIFO queue. Known clip ids are ignored.
    pub fn enqueue<I>(&mut self, descriptors: I) -> usize
    where
        I: IntoIterator<Item = BodyFrameDescriptor>,
    {
        let mut added = 0;
        for descriptor in descriptors {
            if self.contains(descriptor.id) {
                tracing::debug!(clip = ?descriptor.id, "clip already scheduled");
                continue;
            }
            self.queue.push_back(Pending {
                descriptor,
                attempts: 0,
            });
            added += 1;
        }
        added
    }

    /// Start queued clips while workers are free and the queue head lies
    /// within the look-ahead window. Clips already behind the playhead are
    /// dropped; the rest start no earlier than the playhead.
    pub fn pump(&mut self, now: Instant, playhead: FrameIndex) -> usize {
        let horizon = playhead.saturating_add(self.config.lookahead_frames);
        let workers = self.config.workers.max(1);
        let mut started = 0;

        while self.registry.len() < workers {
            match self.queue.front() {
                Some(front) if front.descriptor.start_frame <= horizon => {}
                _ => break,
            }
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            match pending.descriptor.trimmed_from(playhead) {
                Some(descriptor) => {
                    self.launch(descriptor, pending.attempts, now);
                    started += 1;
                }
                None => {
                    tracing::debug!(clip = ?pending.descriptor.id, ?playhead, "dropping clip behind playhead");
                }
            }
        }
        started
    }

    fn launch(&mut self, descriptor: BodyFrameDescriptor, attempts: u32, now: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        let clip = descriptor.id;
        let from = descriptor.start_frame;

        let task = DecodeTask {
            decoder: Arc::clone(&self.decoder),
            descriptor: descriptor.clone(),
            generation,
            cancel: Arc::clone(&cancel),
            tx: self.tx.clone(),
        };
        let entry = InFlight {
            descriptor,
            generation,
            cancel,
            attempts,
            opened_at: now,
            last_progress: now,
            next_frame: from,
            delivered: 0,
        };
        if let Some(previous) = self.registry.insert(clip, entry) {
            previous.abandon();
        }

        tracing::debug!(?clip, ?from, generation, attempts, "decode started");
        self.spawner.spawn(Box::new(move || task.run()));
    }

    /// Deliver decoded frames to `on_frame` and run the watchdog
    ///
    /// Returns the decode failures that exhausted their retries.
    pub fn poll_frames<F>(&mut self, now: Instant, mut on_frame: F) -> Vec<AvatarError>
    where
        F: FnMut(BodyFrame),
    {
        let mut errors = Vec::new();

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                WorkerMessage::Frame {
                    clip,
                    generation,
                    image,
                } => {
                    let Some(task) = self
                        .registry
                        .get_mut(&clip)
                        .filter(|t| t.generation == generation)
                    else {
                        continue;
                    };
                    if image.frame_index < task.next_frame
                        || image.frame_index > task.descriptor.end_frame
                    {
                        continue;
                    }
                    if task.delivered == 0 {
                        self.obs.record(TelemetryEvent::DecodeLatency {
                            clip,
                            latency: now.saturating_duration_since(task.opened_at),
                        });
                    }
                    task.delivered += 1;
                    task.last_progress = now;
                    task.next_frame = image.frame_index.next();

                    on_frame(BodyFrame {
                        frame_index: image.frame_index,
                        descriptor: clip,
                        body_id: task.descriptor.body_id,
                        has_facial_data: task.descriptor.has_facial_data,
                        surface: image.surface,
                    });
                }
                WorkerMessage::Finished { clip, generation } => {
                    if self.is_live(clip, generation) {
                        if let Some(task) = self.registry.remove(&clip) {
                            tracing::debug!(?clip, frames = task.delivered, "decode finished");
                        }
                    }
                }
                WorkerMessage::Failed {
                    clip,
                    generation,
                    reason,
                } => {
                    if self.is_live(clip, generation) {
                        errors.extend(self.fail(clip, reason));
                    }
                }
            }
        }

        let timeout = self.config.frame_timeout();
        let stalled: Vec<DescriptorId> = self
            .registry
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_progress) >= timeout)
            .map(|(clip, _)| *clip)
            .collect();
        for clip in stalled {
            errors.extend(self.fail(clip, format!("no frame within {timeout:?}")));
        }

        errors
    }

    fn is_live(&self, clip: DescriptorId, generation: u64) -> bool {
        self.registry
            .get(&clip)
            .is_some_and(|t| t.generation == generation)
    }

    /// Retry a failed task from its first undelivered frame, or report it
    fn fail(&mut self, clip: DescriptorId, reason: String) -> Option<AvatarError> {
        let task = self.registry.remove(&clip)?;
        task.abandon();
        let mut rest = task.remainder()?;

        if task.attempts < self.config.max_retries {
            tracing::warn!(?clip, from = ?rest.descriptor.start_frame, %reason, "decode failed, retrying");
            self.obs.record(TelemetryEvent::DecodeRetried { clip, reason });
            rest.attempts += 1;
            self.queue.push_front(rest);
            None
        } else {
            tracing::warn!(?clip, %reason, "decode failed");
            self.obs.record(TelemetryEvent::DecodeFailed { clip, reason });
            Some(AvatarError::DecodeFailure {
                stream: StreamKind::Body,
            })
        }
    }

    /// Abandon one clip, queued or decoding
    pub fn abort_one(&mut self, clip: DescriptorId) -> bool {
        if let Some(task) = self.registry.remove(&clip) {
            task.abandon();
            tracing::debug!(?clip, "decode aborted");
            return true;
        }
        let before = self.queue.len();
        self.queue.retain(|p| p.descriptor.id != clip);
        before != self.queue.len()
    }

    /// Abandon everything, queued and decoding
    pub fn abort_all(&mut self) {
        for (_, task) in self.registry.drain() {
            task.abandon();
        }
        self.queue.clear();
        self.discard_undelivered();
        tracing::debug!("decoder cleared");
    }

    /// Stop decoding but keep the work: in-flight clips go back to the
    /// front of the queue from their first undelivered frame
    pub fn park(&mut self) {
        let mut parked: Vec<Pending> = self
            .registry
            .drain()
            .filter_map(|(_, task)| {
                task.abandon();
                task.remainder()
            })
            .collect();
        parked.sort_by_key(|p| Reverse(p.descriptor.start_frame));
        let count = parked.len();
        for pending in parked {
            self.queue.push_front(pending);
        }
        self.discard_undelivered();
        tracing::debug!(parked = count, queued = self.queue.len(), "decoder parked");
    }

    /// Move the decode window to `frame`
    ///
    /// Queued clips ending before `frame` are dropped and the rest trimmed to
    /// start at it. Decoding clips still behind `frame` restart from it.
    pub fn resync_to(&mut self, frame: FrameIndex) {
        self.last_resync = Some(frame);

        let behind: Vec<DescriptorId> = self
            .registry
            .iter()
            .filter(|(_, t)| t.next_frame < frame)
            .map(|(clip, _)| *clip)
            .collect();
        let mut restarted = Vec::new();
        for clip in behind {
            if let Some(task) = self.registry.remove(&clip) {
                task.abandon();
                if let Some(descriptor) = task.descriptor.trimmed_from(frame) {
                    restarted.push(Pending {
                        descriptor,
                        attempts: task.attempts,
                    });
                }
            }
        }

        self.queue.retain(|p| p.descriptor.end_frame >= frame);
        for pending in self.queue.iter_mut() {
            if pending.descriptor.start_frame < frame {
                pending.descriptor.start_frame = frame;
            }
        }
        restarted.sort_by_key(|p| Reverse(p.descriptor.start_frame));
        for pending in restarted {
            self.queue.push_front(pending);
        }

        tracing::debug!(?frame, queued = self.queue.len(), "decoder resynced");
    }

    /// Target of the most recent `resync_to`
    pub fn last_resync(&self) -> Option<FrameIndex> {
        self.last_resync
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.registry.is_empty()
    }

    /// Queued clips in start order
    pub fn queued_descriptors(&self) -> impl Iterator<Item = &BodyFrameDescriptor> {
        self.queue.iter().map(|p| &p.descriptor)
    }

    fn discard_undelivered(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for ParallelDecoder {
    fn drop(&mut self) {
        for task in self.registry.values() {
            task.abandon();
        }
    }
}

impl std::fmt::Debug for ParallelDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDecoder")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("in_flight", &self.registry.len())
            .field("last_resync", &self.last_resync)
            .finish()
    }
}
