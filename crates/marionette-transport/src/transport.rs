//! Transport capability
//!
//! The wire format is not ours. The engine only sees typed events coming in
//! and typed control messages going out; a host adapter does the encoding.

use marionette_core::{AvatarError, AvatarResult, DescriptorId, FrameIndex, SpeechId};
use marionette_state::StreamBatch;
use marionette_visual::BodyFrameDescriptor;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What the server needs to continue a session after a reconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    /// Last fully rendered frame
    pub frame: FrameIndex,
    /// Animation playing at that frame
    pub animation: String,
    /// Avatar state label at that frame
    pub state: String,
    /// Speech in progress, if any
    pub speech_id: Option<SpeechId>,
}

/// Client to server control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Resume(ResumeInfo),
    /// Cut the current speech short
    Interrupt { speech_id: Option<SpeechId> },
    /// Render visibility changed (invisible mode)
    Visibility { visible: bool },
    Stop,
}

impl ControlMessage {
    /// JSON text for transports that speak JSON control frames
    pub fn to_json(&self) -> AvatarResult<String> {
        serde_json::to_string(self).map_err(|e| AvatarError::TransportError(e.to_string()))
    }

    pub fn from_json(text: &str) -> AvatarResult<Self> {
        serde_json::from_str(text).map_err(|e| AvatarError::TransportError(e.to_string()))
    }
}

/// Server to client traffic and connection signals
#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    /// Closed by the peer or the network
    Closed { reason: String },
    /// A connect attempt failed
    Failed { reason: String },
    /// OS reports network connectivity is back
    NetworkOnline,
    /// The underlying socket was reopened by the platform
    SocketReopened,
    /// Stream data
    Batch(StreamBatch),
    /// New body clips to decode
    Descriptors(Vec<BodyFrameDescriptor>),
    /// Clips the server replaced before they played
    Superseded(Vec<DescriptorId>),
}

/// Connection to the avatar server
pub trait Transport: Send {
    /// Start a connection; the outcome arrives as `Opened` or `Failed`
    fn connect(&mut self, resume: Option<ResumeInfo>) -> AvatarResult<()>;

    fn send(&mut self, message: ControlMessage) -> AvatarResult<()>;

    /// Deliberate close; no reconnect follows
    fn close(&mut self);
}

/// Work for the host network task behind a `ChannelTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Connect(Option<ResumeInfo>),
    Send(ControlMessage),
    Close,
}

/// `Transport` that forwards every call to a host task over a channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TransportCommand>,
}

impl ChannelTransport {
    fn forward(&self, command: TransportCommand) -> AvatarResult<()> {
        self.tx
            .send(command)
            .map_err(|_| AvatarError::TransportError("network task has gone away".into()))
    }
}

/// Build a channel transport and the receiving end for the network task
pub fn channel_transport() -> (ChannelTransport, mpsc::UnboundedReceiver<TransportCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTransport { tx }, rx)
}

impl Transport for ChannelTransport {
    fn connect(&mut self, resume: Option<ResumeInfo>) -> AvatarResult<()> {
        self.forward(TransportCommand::Connect(resume))
    }

    fn send(&mut self, message: ControlMessage) -> AvatarResult<()> {
        self.forward(TransportCommand::Send(message))
    }

    fn close(&mut self) {
        if self.forward(TransportCommand::Close).is_err() {
            tracing::debug!("close after network task exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_json() {
        let msg = ControlMessage::Resume(ResumeInfo {
            frame: FrameIndex(250),
            animation: "talk_01".into(),
            state: "speaking".into(),
            speech_id: Some(SpeechId(9)),
        });
        let text = msg.to_json().unwrap();
        assert!(text.contains("\"type\":\"resume\""));
        assert!(text.contains("\"frame\":250"));
        assert_eq!(ControlMessage::from_json(&text).unwrap(), msg);

        let stop = ControlMessage::from_json(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, ControlMessage::Stop);
    }

    #[test]
    fn test_channel_transport_forwards() {
        let (mut transport, mut rx) = channel_transport();
        transport.connect(None).unwrap();
        transport
            .send(ControlMessage::Visibility { visible: false })
            .unwrap();
        transport.close();

        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Connect(None));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportCommand::Send(ControlMessage::Visibility { visible: false })
        );
        assert_eq!(rx.try_recv().unwrap(), TransportCommand::Close);
    }

    #[test]
    fn test_channel_transport_reports_dead_task() {
        let (mut transport, rx) = channel_transport();
        drop(rx);
        assert!(matches!(
            transport.send(ControlMessage::Stop),
            Err(AvatarError::TransportError(_))
        ));
    }
}
