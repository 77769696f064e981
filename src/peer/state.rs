use crate::config::SessionConfig;
use crate::error::Result;
use crate::logger::Notifier;
use crate::media::MediaSource;
use crate::peer::connection::PeerTransport;
use crate::session::{CloseReason, Session};
use crate::signaling::{OutboundMessage, SignalingRelay};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared state of one call: the session plus its collaborators.
///
/// The session lock is never held across an `.await`.
pub struct CallCore {
    pub(crate) session: Mutex<Session>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) relay: Arc<dyn SignalingRelay>,
    pub(crate) media: Arc<dyn MediaSource>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) config: SessionConfig,
}

impl CallCore {
    pub(crate) fn new(
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn SignalingRelay>,
        media: Arc<dyn MediaSource>,
        config: SessionConfig,
    ) -> Self {
        let notifier = Arc::new(Notifier::new());
        Self {
            session: Mutex::new(Session::new(notifier.clone())),
            transport,
            relay,
            media,
            notifier,
            config,
        }
    }

    pub(crate) async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.relay.send(message).await
    }

    /// Enters `Closed` and releases everything the session owned.
    /// Returns false if another path already did it.
    pub(crate) async fn terminate(&self, reason: CloseReason) -> bool {
        let Some(resources) = self.session.lock().close(reason) else {
            return false;
        };
        info!("Terminating call from {} ({:?})", resources.from, reason);

        if let Some(stream) = resources.local_stream {
            self.media.release(stream);
        }
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close transport: {}", e);
        }
        if let Some(peer) = resources.notify_peer {
            if let Err(e) = self.send(OutboundMessage::Hangup { to: peer }).await {
                warn!("Failed to notify peer about hang-up: {}", e);
            }
        }
        self.notifier.emit_closed(reason);
        true
    }
}
