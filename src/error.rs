use crate::peer::transport::TransportError;
use thiserror::Error;

/// Терминальные ошибки ядра: наружу уходит либо канал, либо одна из них
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("no unused session code after {0} attempts")]
    RegistryExhausted(usize),

    #[error("session code not found or expired")]
    CodeNotFound,

    #[error("session code already claimed by another peer")]
    CodeAlreadyClaimed,

    #[error("session already has a live subscriber for this role")]
    SessionFull,

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("session aborted by peer")]
    PeerAborted,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SignalingError {
    /// Нарушение протокола из декодера/конвейера сообщений
    pub(crate) fn violation(context: impl Into<String>) -> Self {
        SignalingError::ProtocolViolation(context.into())
    }
}
