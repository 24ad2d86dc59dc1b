//! Observability context
//!
//! Telemetry is passed explicitly to every component that reports it. There
//! is no global tracker: two avatar instances in one process report into
//! whatever sinks their owners gave them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{DescriptorId, FrameIndex, SpeechId, StreamKind};

/// A single telemetry record
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryEvent {
    /// Nothing was available for the stream at a rendered frame
    FrameDropped { stream: StreamKind, frame: FrameIndex },
    /// Incoming data referenced a frame that was already consumed
    DataExpired { stream: StreamKind, frame: FrameIndex },
    /// Incoming data was rejected as malformed
    DataMalformed { stream: StreamKind, reason: String },
    /// A stream was flushed because the server rewound or re-sent data
    StreamFlushed { stream: StreamKind, dropped: usize },
    /// Entries evicted to honour the stream's capacity bound
    CapacityEvicted { stream: StreamKind, evicted: usize },
    /// Time between opening a clip and its first decoded frame
    DecodeLatency { clip: DescriptorId, latency: Duration },
    /// A clip decode failed and was queued for another attempt
    DecodeRetried { clip: DescriptorId, reason: String },
    /// A clip decode failed permanently
    DecodeFailed { clip: DescriptorId, reason: String },
    /// Ticks were skipped (scheduling jitter, backgrounding)
    TickLag { skipped: u64 },
    /// Audio for a speech segment was cut short
    SpeechInterrupted { speech_id: SpeechId },
    /// A reconnect attempt was issued
    ReconnectAttempt { round: u32, attempt: u32 },
}

/// Destination for telemetry records
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// Discards all records
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: &TelemetryEvent) {}
}

/// Writes every record as a `tracing` event at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        tracing::debug!(target: "marionette::telemetry", ?event, "telemetry");
    }
}

/// Keeps records in memory, for tests and debug overlays
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        RecordingTelemetry::default()
    }

    /// Copy of every record so far
    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Count records matching a predicate
    pub fn count(&self, predicate: impl Fn(&TelemetryEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Observability context threaded through constructors
#[derive(Clone)]
pub struct ObservabilityContext {
    sink: Arc<dyn TelemetrySink>,
    label: Arc<str>,
}

impl ObservabilityContext {
    pub fn new(sink: Arc<dyn TelemetrySink>, label: impl Into<Arc<str>>) -> Self {
        ObservabilityContext {
            sink,
            label: label.into(),
        }
    }

    /// Context that drops everything
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopTelemetry), "avatar")
    }

    /// Context that forwards to `tracing`
    pub fn tracing(label: impl Into<Arc<str>>) -> Self {
        Self::new(Arc::new(TracingTelemetry), label)
    }

    /// Instance label, used to tell concurrent avatars apart in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn record(&self, event: TelemetryEvent) {
        self.sink.record(&event);
    }
}

impl Default for ObservabilityContext {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ObservabilityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityContext")
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_through_context() {
        let sink = Arc::new(RecordingTelemetry::new());
        let ctx = ObservabilityContext::new(sink.clone(), "left");

        ctx.record(TelemetryEvent::TickLag { skipped: 3 });
        ctx.record(TelemetryEvent::FrameDropped {
            stream: StreamKind::Body,
            frame: FrameIndex(9),
        });

        assert_eq!(ctx.label(), "left");
        assert_eq!(sink.snapshot().len(), 2);
        assert_eq!(
            sink.count(|e| matches!(e, TelemetryEvent::TickLag { .. })),
            1
        );
    }
}
