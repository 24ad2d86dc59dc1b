//! Observable events and the typed event bus
//!
//! The engine reports everything the embedding application can observe
//! through a closed set of events. Subscribers pick the kinds they care
//! about and can unsubscribe at any time.

use std::time::Duration;

use crate::{AvatarError, ConnectionState, ErrorCode, RenderState, SpeechId, UiEventBatch, VoiceState};

/// Event emitted by the engine
#[derive(Clone, Debug, PartialEq)]
pub enum AvatarEvent {
    /// Render loop lifecycle changed
    StateChange(RenderState),
    /// Speech started or ended
    VoiceStateChange {
        state: VoiceState,
        speech_id: SpeechId,
        /// Buffered length at start, played length at end
        duration: Duration,
    },
    /// An error from the closed taxonomy
    Error { code: ErrorCode, message: String },
    /// Initial resource load progress, 0-100
    DownloadProgress(u8),
    /// Connection presentation changed
    ConnectionStateChange(ConnectionState),
    /// UI events due at the current frame, in frame order
    UiEvents(UiEventBatch),
}

impl AvatarEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AvatarEvent::StateChange(_) => EventKind::StateChange,
            AvatarEvent::VoiceStateChange { .. } => EventKind::VoiceStateChange,
            AvatarEvent::Error { .. } => EventKind::Error,
            AvatarEvent::DownloadProgress(_) => EventKind::DownloadProgress,
            AvatarEvent::ConnectionStateChange(_) => EventKind::ConnectionStateChange,
            AvatarEvent::UiEvents(_) => EventKind::UiEvents,
        }
    }

    /// Wrap an error for delivery
    pub fn error(err: &AvatarError) -> Self {
        AvatarEvent::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Discriminant of `AvatarEvent`, used for subscription filters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    VoiceStateChange,
    Error,
    DownloadProgress,
    ConnectionStateChange,
    UiEvents,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StateChange,
        EventKind::VoiceStateChange,
        EventKind::Error,
        EventKind::DownloadProgress,
        EventKind::ConnectionStateChange,
        EventKind::UiEvents,
    ];
}

/// Handle returned by `EventBus::subscribe`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&AvatarEvent) + Send>;

struct Subscriber {
    id: SubscriptionId,
    kinds: Vec<EventKind>,
    handler: Handler,
}

/// Typed event bus
///
/// Handlers run synchronously on the publishing thread, in subscription
/// order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    published: u64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Subscribe to the given event kinds
    pub fn subscribe<F>(&mut self, kinds: &[EventKind], handler: F) -> SubscriptionId
    where
        F: FnMut(&AvatarEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            kinds: kinds.to_vec(),
            handler: Box::new(handler),
        });
        id
    }

    /// Subscribe to every event kind
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&AvatarEvent) + Send + 'static,
    {
        self.subscribe(&EventKind::ALL, handler)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver an event to every matching subscriber
    pub fn publish(&mut self, event: &AvatarEvent) {
        let kind = event.kind();
        self.published += 1;
        for sub in self.subscribers.iter_mut() {
            if sub.kinds.contains(&kind) {
                (sub.handler)(event);
            }
        }
    }

    /// Deliver a batch of events in order
    pub fn publish_all<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = AvatarEvent>,
    {
        for event in events {
            self.publish(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Total events published over the bus lifetime
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("published", &self.published)
            .finish()
    }
}
