use crate::peer::codec::CodecError;
use crate::peer::types::{ConnectionBundle, DescriptionPayload, IceCandidate, PeerRole};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("ice failure: {0}")]
    Ice(String),

    /// Временная недостижимость; негоциатор повторяет попытку
    #[error("connection attempt failed: {0}")]
    Unreachable(String),

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Сырые концы установленного линка; ChannelHandle оборачивает их
/// и отвечает за семантику закрытия
pub struct EstablishedChannel {
    /// Байты наружу (транспорт доставляет надёжно и по порядку)
    pub outbound: mpsc::UnboundedSender<Bytes>,
    /// Байты от пира
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
    /// Сигнал транспорту закрыть нижележащий линк
    pub shutdown: Arc<Notify>,
}

/// Шов между негоциатором и конкретным транспортом.
///
/// Порядок вызовов: инициатор делает `create_local_description` до обмена,
/// отвечающий — после `apply_remote_description` с оффером. Кандидаты
/// применяются в любом порядке после remote description. `connect` — одна
/// ограниченная по времени попытка; повторы — забота негоциатора.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn role(&self) -> PeerRole;

    async fn create_local_description(&self) -> Result<ConnectionBundle, TransportError>;

    async fn apply_remote_description(
        &self,
        description: DescriptionPayload,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Поток локальных trickle-кандидатов; забрать можно один раз
    async fn take_candidate_stream(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>>;

    async fn connect(&self, attempt_timeout: Duration)
        -> Result<EstablishedChannel, TransportError>;

    async fn shutdown(&self);
}
