use crate::error::{CallError, Result};
use crate::peer::connection::PeerTransport;
use crate::peer::state::CallCore;
use crate::peer::types::{ConnectivityState, SdpKind};
use crate::session::SessionState;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::sleep;

/// Periodic re-apply of the current descriptions while ICE is `disconnected`.
pub struct ReconnectionScheduler {
    core: Arc<CallCore>,
}

impl ReconnectionScheduler {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        Self { core }
    }

    pub fn start(&self) {
        let mut session = self.core.session.lock();
        if session.state() != SessionState::TransientlyDisconnected {
            return;
        }
        if session.has_reconnect_task() {
            debug!("Reconnection polling already running");
            return;
        }
        let epoch = session.next_epoch();
        let core = self.core.clone();
        let handle = tokio::spawn(async move { poll_until_recovered(core, epoch).await });
        session.set_reconnect_task(epoch, handle);
    }
}

async fn poll_until_recovered(core: Arc<CallCore>, epoch: u64) {
    let poll = core.config.reconnect_poll_interval();
    let mut attempt: u32 = 0;

    while core.transport.connectivity_state() == ConnectivityState::Disconnected {
        info!("Attempt to reconnect in {} s...", poll.as_secs());
        sleep(poll).await;

        if !core.session.lock().is_reconnect_current(epoch) {
            return;
        }
        if core.transport.connectivity_state() != ConnectivityState::Disconnected {
            break;
        }

        attempt += 1;
        info!("Attempting reconnect #{}", attempt);
        match reapply_descriptions(core.transport.as_ref()).await {
            Ok(()) => debug!("Reconnect attempt #{} re-applied descriptions", attempt),
            // не фатально: повторим на следующем тике
            Err(e) => warn!("Reconnect attempt #{} failed: {}", attempt, e),
        }
    }

    let state_now = core.transport.connectivity_state();
    let recovered = {
        let mut session = core.session.lock();
        if !session.is_reconnect_current(epoch) {
            return;
        }
        session.detach_reconnect(epoch);
        if state_now.is_established()
            && session
                .transition(SessionState::Connected, "reconnection")
                .is_ok()
        {
            session.set_online(true);
            true
        } else {
            false
        }
    };

    if recovered {
        info!("Connection restored after {} reconnect attempts", attempt);
        core.notifier.emit_connection_recovered();
    } else {
        debug!("Reconnection polling stopped, transport is {:?}", state_now);
    }
}

/// Re-sets local and remote descriptions, keeping the original offerer/answerer order.
pub async fn reapply_descriptions(transport: &dyn PeerTransport) -> Result<()> {
    let remote = transport
        .remote_description()
        .await
        .ok_or_else(|| CallError::Transport("no remote description to re-apply".into()))?;

    if remote.kind == SdpKind::Answer {
        transport.reapply_local_description().await?;
        transport.reapply_remote_description().await?;
    } else {
        transport.reapply_remote_description().await?;
        transport.reapply_local_description().await?;
    }
    Ok(())
}
