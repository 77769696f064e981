mod call;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
mod utils;

pub use call::CallSession;
pub use config::SessionConfig;
pub use error::{CallError, MediaAcquisitionError, Result};
pub use logger::{init_logger, Notifier, SessionEvent};
pub use media::{LocalStream, LocalTrack, MediaSource, StaticSampleSource};
pub use session::{CloseReason, SessionState};
pub use signaling::{
    ChannelRelay, Envelope, OutboundMessage, RelaySubscription, SignalingMessage, SignalingRelay,
};
pub use utils::sdp_fingerprint;
