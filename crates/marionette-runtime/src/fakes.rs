//! Test doubles for host capabilities

use std::sync::Arc;

use bytes::Bytes;
use marionette_core::{AvatarError, AvatarResult, FrameIndex, SpeechId};
use marionette_visual::{
    BodyDecoder, BodyFrameDescriptor, DecodeStream, DecodedImage, ReleaseLedger, SurfaceHandle,
    SurfaceId, Task, TaskSpawner,
};
use marionette_transport::{ControlMessage, ResumeInfo, Transport};
use marionette_voice::{AudioFormat, AudioSink};
use parking_lot::Mutex;

use crate::render::{RenderInput, Renderer};

#[derive(Debug, Default)]
pub struct RenderLog {
    /// (frame, body frame shown, fresh)
    pub presented: Vec<(FrameIndex, Option<FrameIndex>, bool)>,
    pub offline: Vec<u64>,
    pub ensured: u32,
    pub released: u32,
    pub fail_ensure: bool,
}

#[derive(Clone, Default)]
pub struct FakeRenderer(pub Arc<Mutex<RenderLog>>);

impl Renderer for FakeRenderer {
    fn ensure_resources(&mut self) -> AvatarResult<()> {
        let mut log = self.0.lock();
        if log.fail_ensure {
            return Err(AvatarError::ResourceInitFailure("no gpu".into()));
        }
        log.ensured += 1;
        Ok(())
    }

    fn release_resources(&mut self) {
        self.0.lock().released += 1;
    }

    fn present(&mut self, input: RenderInput<'_>) {
        self.0.lock().presented.push((
            input.frame,
            input.body.map(|b| b.frame_index),
            input.body_fresh,
        ));
    }

    fn present_offline(&mut self, _animation: &str, tick: u64) {
        self.0.lock().offline.push(tick);
    }
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub started: Vec<SpeechId>,
    pub stopped: Vec<SpeechId>,
    pub written: usize,
}

#[derive(Clone, Default)]
pub struct FakeSink(pub Arc<Mutex<SinkLog>>);

impl AudioSink for FakeSink {
    fn start(&mut self, speech_id: SpeechId, _format: &AudioFormat) {
        self.0.lock().started.push(speech_id);
    }

    fn write(&mut self, _speech_id: SpeechId, _payload: &Bytes) {
        self.0.lock().written += 1;
    }

    fn stop(&mut self, speech_id: SpeechId) {
        self.0.lock().stopped.push(speech_id);
    }

    fn set_volume(&mut self, _volume: f32) {}
}

#[derive(Clone, Default)]
pub struct QueueSpawner(pub Arc<Mutex<Vec<Task>>>);

impl QueueSpawner {
    pub fn run_all(&self) -> usize {
        let tasks: Vec<Task> = std::mem::take(&mut *self.0.lock());
        let n = tasks.len();
        for task in tasks {
            task();
        }
        n
    }
}

impl TaskSpawner for QueueSpawner {
    fn spawn(&self, task: Task) {
        self.0.lock().push(task);
    }
}

/// Decodes every frame of a clip, one surface per frame
pub struct ClipDecoder {
    pub ledger: Arc<ReleaseLedger>,
}

struct ClipStream {
    next: FrameIndex,
    end: FrameIndex,
    ledger: Arc<ReleaseLedger>,
}

impl DecodeStream for ClipStream {
    fn next_image(&mut self) -> AvatarResult<Option<DecodedImage>> {
        if self.next > self.end {
            return Ok(None);
        }
        let frame = self.next;
        self.next = frame.next();
        Ok(Some(DecodedImage {
            frame_index: frame,
            surface: SurfaceHandle::new(SurfaceId(frame.0), self.ledger.clone()),
        }))
    }

    fn cancel(&mut self) {}
}

impl BodyDecoder for ClipDecoder {
    fn open(
        &self,
        descriptor: &BodyFrameDescriptor,
        from: FrameIndex,
    ) -> AvatarResult<Box<dyn DecodeStream>> {
        Ok(Box::new(ClipStream {
            next: from,
            end: descriptor.end_frame,
            ledger: self.ledger.clone(),
        }))
    }
}

#[derive(Debug, Default)]
pub struct TransportLog {
    pub connects: Vec<Option<ResumeInfo>>,
    pub sent: Vec<ControlMessage>,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct FakeTransport(pub Arc<Mutex<TransportLog>>);

impl Transport for FakeTransport {
    fn connect(&mut self, resume: Option<ResumeInfo>) -> AvatarResult<()> {
        self.0.lock().connects.push(resume);
        Ok(())
    }

    fn send(&mut self, message: ControlMessage) -> AvatarResult<()> {
        self.0.lock().sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.0.lock().closed = true;
    }
}
