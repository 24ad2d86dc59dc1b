//! Audio chunks and formats

use bytes::Bytes;
use marionette_core::{AvatarError, AvatarResult, FrameIndex, FrameRange, SpeechId, StreamKind};
use serde::{Deserialize, Serialize};

/// Compressed container formats the server may send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Mp3,
    Aac,
    Opus,
}

/// Encoding of an audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    /// Interleaved signed 16-bit little-endian samples
    Pcm16 { sample_rate: u32, channels: u16 },
    /// Container stream the platform decodes
    Container(ContainerKind),
}

impl AudioFormat {
    pub fn is_container(&self) -> bool {
        matches!(self, AudioFormat::Container(_))
    }
}

/// What the host audio path can play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCapabilities {
    /// Host decodes container formats natively
    pub container_supported: bool,
}

impl Default for AudioCapabilities {
    fn default() -> Self {
        AudioCapabilities {
            container_supported: true,
        }
    }
}

impl AudioCapabilities {
    /// Raw PCM only
    pub fn pcm_only() -> Self {
        AudioCapabilities {
            container_supported: false,
        }
    }

    pub fn supports(&self, format: &AudioFormat) -> bool {
        match format {
            AudioFormat::Pcm16 { .. } => true,
            AudioFormat::Container(_) => self.container_supported,
        }
    }
}

/// A slice of speech audio covering a frame range
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub speech_id: SpeechId,
    pub start_frame: FrameIndex,
    pub end_frame: FrameIndex,
    pub payload: Bytes,
    pub format: AudioFormat,
    /// Final chunk of the speech segment
    pub is_last: bool,
}

impl AudioChunk {
    pub fn range(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }

    /// Reject chunks the host cannot play or that are internally broken
    pub fn validate(&self, caps: &AudioCapabilities) -> AvatarResult<()> {
        let malformed = |reason: &str| AvatarError::DataMalformed {
            stream: StreamKind::Audio,
            reason: reason.to_string(),
        };

        if !caps.supports(&self.format) {
            return Err(malformed("container audio not supported by host"));
        }
        if self.end_frame < self.start_frame {
            return Err(malformed("end frame before start frame"));
        }
        if self.payload.is_empty() && !self.is_last {
            return Err(malformed("empty payload"));
        }
        if let AudioFormat::Pcm16 { channels, .. } = self.format {
            let frame_bytes = 2 * channels.max(1) as usize;
            if self.payload.len() % frame_bytes != 0 {
                return Err(malformed("pcm payload not a whole number of samples"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(format: AudioFormat, payload: &'static [u8]) -> AudioChunk {
        AudioChunk {
            speech_id: SpeechId(1),
            start_frame: FrameIndex(0),
            end_frame: FrameIndex(11),
            payload: Bytes::from_static(payload),
            format,
            is_last: false,
        }
    }

    #[test]
    fn test_container_rejected_without_capability() {
        let c = chunk(AudioFormat::Container(ContainerKind::Mp3), b"ID3");
        assert!(c.validate(&AudioCapabilities::default()).is_ok());

        let err = c.validate(&AudioCapabilities::pcm_only()).unwrap_err();
        assert!(matches!(
            err,
            AvatarError::DataMalformed {
                stream: StreamKind::Audio,
                ..
            }
        ));
    }

    #[test]
    fn test_pcm_alignment() {
        let stereo = AudioFormat::Pcm16 {
            sample_rate: 16_000,
            channels: 2,
        };
        assert!(chunk(stereo, &[0, 0, 0, 0]).validate(&AudioCapabilities::pcm_only()).is_ok());
        assert!(chunk(stereo, &[0, 0, 0]).validate(&AudioCapabilities::pcm_only()).is_err());
    }

    #[test]
    fn test_empty_payload_only_allowed_on_last() {
        let pcm = AudioFormat::Pcm16 {
            sample_rate: 16_000,
            channels: 1,
        };
        let mut c = chunk(pcm, b"");
        assert!(c.validate(&AudioCapabilities::default()).is_err());
        c.is_last = true;
        assert!(c.validate(&AudioCapabilities::default()).is_ok());
    }
}
