use crate::peer::types::SdpKind;
use crate::session::SessionState;
use thiserror::Error;

/// Ошибки захвата локального медиа
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAcquisitionError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("no capture device available")]
    NoDevice,
    #[error("media acquisition failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("`{operation}` is not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error("failed to apply {kind} description: {reason}")]
    DescriptionApply { kind: SdpKind, reason: String },

    #[error("answer received but no offer is outstanding")]
    DescriptionMismatch,

    #[error("connection permanently lost")]
    PermanentDisconnect,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CallError {
    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        CallError::InvalidState { operation, state }
    }

    /// Ошибки, которые гасятся локально и не ломают сессию
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallError::InvalidState { .. } | CallError::DescriptionMismatch
        )
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
