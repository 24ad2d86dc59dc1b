//! Avatar session
//!
//! Glue between the connection and the render loop. The session feeds
//! transport traffic into the scheduler, turns connection changes into
//! retry decisions, and publishes everything observable on the event bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marionette_core::{
    AvatarError, AvatarEvent, AvatarResult, ConnectionState, EventBus, EventKind, FrameIndex,
    ObservabilityContext, SpeechId, SubscriptionId, TelemetrySink,
};
use marionette_state::FrameCache;
use marionette_time::{AnimationClock, TimeSource};
use marionette_transport::{
    ConnectionRetryEngine, ControlMessage, ReconnectSignal, ResumeInfo, RetryCommand, RetryPhase,
    Transport, TransportEvent,
};
use marionette_visual::{BodyDecoder, FaceInterpolator, ParallelDecoder, TaskSpawner};
use marionette_voice::{AudioCompositor, AudioSink};

use crate::config::AvatarConfig;
use crate::render::Renderer;
use crate::scheduler::{RenderScheduler, SchedulerParts, Transition};

/// Host capabilities a session is built from
pub struct SessionParts {
    pub time: Arc<dyn TimeSource>,
    pub transport: Box<dyn Transport>,
    pub renderer: Box<dyn Renderer>,
    pub decoder: Arc<dyn BodyDecoder>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub audio_sink: Box<dyn AudioSink>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// One live avatar
pub struct AvatarSession {
    scheduler: RenderScheduler,
    retry: ConnectionRetryEngine,
    transport: Box<dyn Transport>,
    bus: EventBus,
    time: Arc<dyn TimeSource>,
    connection: ConnectionState,
    terminal: Option<AvatarError>,
}

impl AvatarSession {
    pub fn new(config: &AvatarConfig, parts: SessionParts) -> Self {
        let obs = ObservabilityContext::new(parts.telemetry, "avatar");
        let clock = AnimationClock::with_config(parts.time.clone(), &config.clock);
        let rate = clock.rate();

        let scheduler = RenderScheduler::new(
            config.scheduler.clone(),
            SchedulerParts {
                time: parts.time.clone(),
                clock,
                cache: FrameCache::with_config(config.cache.clone(), obs.clone()),
                decoder: ParallelDecoder::with_config(
                    config.decoder.clone(),
                    parts.decoder,
                    parts.spawner,
                    obs.clone(),
                ),
                audio: AudioCompositor::with_config(
                    config.audio.clone(),
                    rate,
                    parts.audio_sink,
                    obs.clone(),
                ),
                face: FaceInterpolator::with_config(config.face.clone()),
                renderer: parts.renderer,
            },
            obs.clone(),
        );

        AvatarSession {
            scheduler,
            retry: ConnectionRetryEngine::with_config(config.retry.clone(), obs),
            transport: parts.transport,
            bus: EventBus::new(),
            time: parts.time,
            connection: ConnectionState::Offline,
            terminal: None,
        }
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    pub fn retry(&self) -> &ConnectionRetryEngine {
        &self.retry
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.connection == ConnectionState::Closed
    }

    /// Error that ended the session, if it did not end deliberately
    pub fn terminal_error(&self) -> Option<&AvatarError> {
        self.terminal.as_ref()
    }

    /// Interval the host should tick at
    pub fn frame_interval(&self) -> Duration {
        self.scheduler.clock().frame_interval()
    }

    pub fn subscribe<F>(&mut self, kinds: &[EventKind], handler: F) -> SubscriptionId
    where
        F: FnMut(&AvatarEvent) + Send + 'static,
    {
        self.bus.subscribe(kinds, handler)
    }

    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&AvatarEvent) + Send + 'static,
    {
        self.bus.subscribe_all(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Open the initial connection
    pub fn connect(&mut self) -> AvatarResult<()> {
        if self.is_closed() {
            return Err(AvatarError::TransportError("session closed".into()));
        }
        if let Err(e) = self.transport.connect(None) {
            tracing::warn!(error = %e, "initial connect failed");
            let now = self.time.now();
            let next = self.retry.on_connect_failed(now);
            self.apply(next, now);
            return Err(e);
        }
        Ok(())
    }

    pub fn start(&mut self) -> AvatarResult<()> {
        let result = self.scheduler.start();
        self.flush_events();
        result
    }

    pub fn pause(&mut self) -> AvatarResult<()> {
        let result = self.scheduler.pause();
        self.flush_events();
        result
    }

    pub fn resume(&mut self) -> AvatarResult<()> {
        let result = self.scheduler.resume();
        self.flush_events();
        result
    }

    /// Deliberate end of the session
    pub fn stop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.transport.send(ControlMessage::Stop) {
            tracing::debug!(error = %e, "stop not delivered");
        }
        self.retry.close();
        self.transport.close();
        self.scheduler.stop();
        self.set_connection(ConnectionState::Closed);
    }

    /// Cut the current speech short and tell the server
    pub fn interrupt(&mut self) -> Option<SpeechId> {
        let interrupted = self.scheduler.interrupt();
        if let Some(id) = interrupted {
            self.send(ControlMessage::Interrupt {
                speech_id: Some(id),
            });
        }
        self.flush_events();
        interrupted
    }

    /// Show or hide the avatar. While hidden audio and UI events continue.
    pub fn set_visible(&mut self, visible: bool) {
        let transition = if visible {
            Transition::Visible
        } else {
            Transition::Invisible
        };
        self.scheduler.queue_transition(transition);
        self.send(ControlMessage::Visibility { visible });
        self.flush_events();
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.scheduler.set_volume(volume);
    }

    fn send(&mut self, message: ControlMessage) {
        if self.connection != ConnectionState::Online {
            tracing::debug!(?message, "not connected, control message dropped");
            return;
        }
        if let Err(e) = self.transport.send(message) {
            tracing::warn!(error = %e, "control message not delivered");
        }
    }

    /// What the server needs to continue the timeline where we stopped
    pub fn resume_info(&self) -> ResumeInfo {
        ResumeInfo {
            frame: self
                .scheduler
                .last_rendered()
                .unwrap_or_else(|| self.scheduler.current_frame()),
            animation: self.scheduler.animation().unwrap_or_default().to_owned(),
            state: self.scheduler.avatar_state().unwrap_or_default().to_owned(),
            speech_id: self.scheduler.current_speech(),
        }
    }

    /// Handle one event from the transport
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        let now = self.time.now();
        match event {
            TransportEvent::Opened => {
                let next = self.retry.on_connected(now);
                if next.is_none() && self.retry.phase() == RetryPhase::Connected {
                    self.set_connection(ConnectionState::Online);
                }
                self.apply(next, now);
            }
            TransportEvent::Closed { reason } => {
                if !self.is_closed() {
                    tracing::warn!(%reason, "connection closed");
                    let next = self.retry.on_disconnect(now);
                    self.apply(next, now);
                }
            }
            TransportEvent::Failed { reason } => {
                tracing::warn!(%reason, "connect failed");
                let next = self.retry.on_connect_failed(now);
                self.apply(next, now);
            }
            TransportEvent::NetworkOnline => {
                let next = self.retry.signal(ReconnectSignal::NetworkOnline, now);
                self.apply(next, now);
            }
            TransportEvent::SocketReopened => {
                let next = self.retry.signal(ReconnectSignal::SocketReopened, now);
                self.apply(next, now);
            }
            TransportEvent::Batch(batch) => {
                self.scheduler.ingest(batch);
            }
            TransportEvent::Descriptors(descriptors) => {
                self.scheduler.enqueue(descriptors);
            }
            TransportEvent::Superseded(clips) => {
                self.scheduler.supersede(&clips);
            }
        }
        self.flush_events();
    }

    /// Run retry timers and one render tick
    pub fn tick(&mut self) -> Option<FrameIndex> {
        let now = self.time.now();
        let next = self.retry.poll(now);
        self.apply(next, now);
        let frame = self.scheduler.tick();
        self.flush_events();
        frame
    }

    fn apply(&mut self, command: Option<RetryCommand>, now: Instant) {
        let mut next = command;
        while let Some(command) = next.take() {
            match command {
                RetryCommand::Connect { round, attempt } => {
                    let resume = self.resume_info();
                    tracing::debug!(round, attempt, frame = %resume.frame, "connecting with resume");
                    if let Err(e) = self.transport.connect(Some(resume)) {
                        tracing::warn!(error = %e, "reconnect failed");
                        next = self.retry.on_connect_failed(now);
                    }
                }
                RetryCommand::EnterOffline => {
                    self.scheduler.enter_offline();
                    self.set_connection(ConnectionState::Offline);
                }
                RetryCommand::Resume => {
                    let resume = self.resume_info();
                    self.scheduler.exit_offline();
                    self.set_connection(ConnectionState::Online);
                    // The server continues its timeline from here
                    self.send(ControlMessage::Resume(resume));
                }
                RetryCommand::GiveUp => {
                    let err = AvatarError::ConnectionRetryExhausted {
                        attempts: self.retry.attempts_made(),
                    };
                    tracing::error!(error = %err, "giving up on the session");
                    self.transport.close();
                    self.scheduler.stop();
                    self.flush_events();
                    self.bus.publish(&AvatarEvent::error(&err));
                    self.set_connection(ConnectionState::Closed);
                    self.terminal = Some(err);
                }
            }
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        self.flush_events();
        if self.connection != state {
            tracing::info!(from = ?self.connection, to = ?state, "connection state");
            self.connection = state;
            self.bus.publish(&AvatarEvent::ConnectionStateChange(state));
        }
    }

    fn flush_events(&mut self) {
        let events = self.scheduler.drain_events();
        self.bus.publish_all(events);
    }
}

impl std::fmt::Debug for AvatarSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvatarSession")
            .field("connection", &self.connection)
            .field("retry", &self.retry.phase())
            .field("scheduler", &self.scheduler)
            .field("terminal", &self.terminal)
            .finish()
    }
}
