pub mod codec;
pub mod memory;
pub mod transport;
pub mod types;
pub mod webrtc;

pub use transport::{EstablishedChannel, PeerTransport, TransportError};
pub use types::{
    ConnectionBundle, DescriptionKind, DescriptionPayload, IceCandidate, PeerHello, PeerRole,
};
