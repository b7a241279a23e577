//! Ядро сигналинга Zippy: брокер коротких кодов сессий и протокол
//! установления p2p-соединения. Снаружи — либо готовый байтовый канал,
//! либо одна терминальная ошибка; передача файлов живёт уровнем выше.

pub mod channel;
pub mod config;
pub mod error;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod session;
pub mod share;
pub mod signaling;
mod utils;

pub use channel::{ChannelHandle, ChannelMetadata};
pub use config::{IceServerConfig, SignalingConfig};
pub use error::SignalingError;
pub use peer::memory::MemoryTransport;
pub use peer::transport::{EstablishedChannel, PeerTransport, TransportError};
pub use peer::types::{
    ConnectionBundle, DescriptionKind, DescriptionPayload, IceCandidate, PeerHello, PeerRole,
};
pub use peer::webrtc::WebrtcTransport;
pub use registry::{CodeRegistry, SessionCode};
pub use relay::{PayloadKind, RelayMessage, RelaySubscription, SignalingRelay};
pub use session::{AbortHandle, NegotiationContext, NegotiationState, SessionNegotiator};
pub use share::ShareLink;
pub use signaling::SignalingService;
