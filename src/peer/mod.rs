pub mod connection;
pub mod health;
pub mod negotiation;
pub mod reconnect;
pub mod state;
pub mod types;


pub use connection::{PeerTransport, RtcTransport};
pub use health::{ConnectionHealthMonitor, HealthSample, Liveness};
pub use negotiation::{NegotiationCoordinator, NegotiationOutcome};
pub use reconnect::ReconnectionScheduler;
pub use types::{
    ConnectivityState, InboundByteCounts, MediaKind, PeerId, RemoteStream, RemoteTrack, SdpKind,
    ServerConfig, SessionDescription, TransportEvent,
};
