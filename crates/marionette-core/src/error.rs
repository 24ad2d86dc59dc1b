//! Error types for the avatar engine

use thiserror::Error;

use crate::{FrameIndex, RenderState, StreamKind};

/// Core avatar errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvatarError {
    // Data errors - recovered locally, the frame is dropped
    #[error("Decode failure on {stream} stream")]
    DecodeFailure { stream: StreamKind },

    #[error("Data expired on {stream} stream: frame {frame} already passed")]
    DataExpired { stream: StreamKind, frame: FrameIndex },

    #[error("Malformed data on {stream} stream: {reason}")]
    DataMalformed { stream: StreamKind, reason: String },

    // Connection errors
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection retries exhausted after {attempts} attempts")]
    ConnectionRetryExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    TransportError(String),

    // Resource errors - fatal to session start
    #[error("Resource initialisation failed: {0}")]
    ResourceInitFailure(String),

    // API misuse
    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        from: RenderState,
        action: &'static str,
    },
}

impl AvatarError {
    /// Stable numeric code reported through `onError`
    pub fn code(&self) -> ErrorCode {
        match self {
            AvatarError::DecodeFailure { .. } => ErrorCode::DecodeFailure,
            AvatarError::DataExpired { .. } => ErrorCode::DataExpired,
            AvatarError::DataMalformed { .. } => ErrorCode::DataMalformed,
            AvatarError::ConnectionLost => ErrorCode::ConnectionLost,
            AvatarError::ConnectionRetryExhausted { .. } => ErrorCode::ConnectionRetryExhausted,
            AvatarError::TransportError(_) => ErrorCode::ConnectionLost,
            AvatarError::ResourceInitFailure(_) => ErrorCode::ResourceInitFailure,
            AvatarError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
        }
    }

    /// Recoverable errors never halt the render loop
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AvatarError::DecodeFailure { .. }
                | AvatarError::DataExpired { .. }
                | AvatarError::DataMalformed { .. }
                | AvatarError::ConnectionLost
                | AvatarError::TransportError(_)
                | AvatarError::InvalidTransition { .. }
        )
    }

    /// Stream the error relates to, if any
    pub fn stream(&self) -> Option<StreamKind> {
        match self {
            AvatarError::DecodeFailure { stream }
            | AvatarError::DataExpired { stream, .. }
            | AvatarError::DataMalformed { stream, .. } => Some(*stream),
            _ => None,
        }
    }
}

/// Error codes of the closed taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    DecodeFailure = 1001,
    DataExpired = 1002,
    DataMalformed = 1003,
    ConnectionLost = 2001,
    ConnectionRetryExhausted = 2002,
    ResourceInitFailure = 3001,
    InvalidTransition = 4001,
}

impl ErrorCode {
    #[inline]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Result type for avatar operations
pub type AvatarResult<T> = Result<T, AvatarError>;
