use crate::config::SessionConfig;
use crate::error::{CallError, Result};
use crate::logger::SessionEvent;
use crate::media::MediaSource;
use crate::peer::connection::{PeerTransport, RtcTransport};
use crate::peer::health::{ConnectionHealthMonitor, HealthSample};
use crate::peer::negotiation::{NegotiationCoordinator, NegotiationOutcome};
use crate::peer::reconnect::ReconnectionScheduler;
use crate::peer::state::CallCore;
use crate::peer::types::{ConnectivityState, PeerId, RemoteStream, SessionDescription, TransportEvent};
use crate::session::{CloseReason, SessionState};
use crate::signaling::{RelaySubscription, SignalingMessage, SignalingRelay};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

/// Handle to the one call of a room visit.
#[derive(Clone)]
pub struct CallSession {
    core: Arc<CallCore>,
}

impl CallSession {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn SignalingRelay>,
        media: Arc<dyn MediaSource>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(CallCore::new(transport, relay, media, config)),
        })
    }

    /// Session over a webrtc-rs peer connection. Feed the returned events to [`CallSession::run`].
    pub async fn with_webrtc(
        relay: Arc<dyn SignalingRelay>,
        media: Arc<dyn MediaSource>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;
        config.init_logging();
        let (transport, events) = RtcTransport::new(&config).await?;
        let session = Self::new(Arc::new(transport), relay, media, config)?;
        Ok((session, events))
    }

    fn negotiation(&self) -> NegotiationCoordinator {
        NegotiationCoordinator::new(self.core.clone())
    }

    // ---------- accessors ----------

    pub fn id(&self) -> String {
        self.core.session.lock().id().to_owned()
    }

    pub fn state(&self) -> SessionState {
        self.core.session.lock().state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.notifier.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.core.notifier.watch_state()
    }

    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.core.session.lock().remote_peer_id().cloned()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.core.session.lock().remote_stream().cloned()
    }

    pub fn has_local_stream(&self) -> bool {
        self.core.session.lock().local_stream().is_some()
    }

    pub fn is_online(&self) -> bool {
        self.core.session.lock().is_online()
    }

    pub fn is_renegotiating(&self) -> bool {
        self.core.session.lock().is_renegotiating()
    }

    pub fn coalesced_renegotiations(&self) -> u32 {
        self.core.session.lock().coalesced()
    }

    pub fn last_health_samples(&self) -> Vec<HealthSample> {
        self.core.session.lock().health().samples()
    }

    // ---------- user actions ----------

    pub async fn initiate_call(&self, to: PeerId) -> Result<()> {
        self.negotiation().initiate_call(to).await
    }

    /// Calls the peer announced by `user:joined`.
    pub async fn call_remote_peer(&self) -> Result<()> {
        let Some(peer) = self.remote_peer_id() else {
            return Err(CallError::invalid_state("call_remote_peer", self.state()));
        };
        self.initiate_call(peer).await
    }

    pub async fn send_streams(&self) -> Result<usize> {
        self.negotiation().send_streams().await
    }

    pub async fn handle_negotiation_needed(&self) -> Result<NegotiationOutcome> {
        self.negotiation().handle_negotiation_needed().await
    }

    pub async fn restart_ice(&self) -> Result<NegotiationOutcome> {
        self.negotiation().restart_ice().await
    }

    /// Returns false if the session was already closed.
    pub async fn hang_up(&self) -> bool {
        self.core.terminate(CloseReason::LocalHangup).await
    }

    // ---------- relay ----------

    pub async fn handle_incoming_call(&self, from: PeerId, offer: SessionDescription) -> Result<()> {
        self.negotiation().handle_incoming_call(from, offer).await
    }

    pub async fn handle_call_accepted(&self, from: PeerId, answer: SessionDescription) -> Result<()> {
        self.negotiation().handle_call_accepted(from, answer).await
    }

    pub async fn handle_incoming_renegotiation(
        &self,
        from: PeerId,
        offer: SessionDescription,
    ) -> Result<()> {
        self.negotiation()
            .handle_incoming_renegotiation(from, offer)
            .await
    }

    pub async fn handle_final_renegotiation_answer(
        &self,
        from: Option<PeerId>,
        answer: SessionDescription,
    ) -> Result<()> {
        self.negotiation()
            .handle_final_renegotiation_answer(from, answer)
            .await
    }

    pub async fn handle_message(&self, message: SignalingMessage) -> Result<()> {
        debug!("relay -> {}", message.event_name());
        match message {
            SignalingMessage::PeerJoined { id, email } => {
                info!("{} joined the room ({})", id, email.as_deref().unwrap_or("-"));
                let mut session = self.core.session.lock();
                if session.state() == SessionState::Idle {
                    session.set_remote_peer(id);
                }
                Ok(())
            }
            SignalingMessage::IncomingCall { from, offer } => {
                self.handle_incoming_call(from, offer).await
            }
            SignalingMessage::CallAccepted { from, ans } => {
                self.handle_call_accepted(from, ans).await
            }
            SignalingMessage::RenegotiationNeeded { from, offer } => {
                self.handle_incoming_renegotiation(from, offer).await
            }
            SignalingMessage::RenegotiationFinal { from, ans } => {
                self.handle_final_renegotiation_answer(from, ans).await
            }
            SignalingMessage::TempDisconnect => {
                info!("Peer reported a temporary disconnect");
                self.reevaluate_connectivity().await;
                Ok(())
            }
            SignalingMessage::CallEnded { from } => {
                if self.remote_peer_id().as_ref() != Some(&from) {
                    debug!("call:ended from {} is not for this call", from);
                    return Ok(());
                }
                info!("{} hung up", from);
                self.core.terminate(CloseReason::RemoteHangup).await;
                Ok(())
            }
        }
    }

    // ---------- transport ----------

    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::ConnectivityChanged(state) => {
                self.handle_connectivity_change(state).await;
                Ok(())
            }
            TransportEvent::NegotiationNeeded => {
                self.handle_negotiation_needed().await?;
                Ok(())
            }
            TransportEvent::Track(track) => {
                self.core.session.lock().add_remote_track(track);
                Ok(())
            }
        }
    }

    /// Network interface went down: same path as a degraded transport.
    pub async fn handle_network_offline(&self) {
        warn!("Network offline");
        self.core.session.lock().set_online(false);
        self.reevaluate_connectivity().await;
    }

    async fn reevaluate_connectivity(&self) {
        let current = self.core.transport.connectivity_state();
        debug!("Re-evaluating connectivity: transport is {:?}", current);
        self.handle_connectivity_change(current).await;
    }

    pub async fn handle_connectivity_change(&self, state: ConnectivityState) {
        match state {
            ConnectivityState::Disconnected | ConnectivityState::Failed => self.on_degraded(state),
            ConnectivityState::Connected | ConnectivityState::Completed => self.on_established(),
            ConnectivityState::Closed => {
                self.core.terminate(CloseReason::TransportClosed).await;
            }
            ConnectivityState::New | ConnectivityState::Checking => {}
        }
    }

    fn on_degraded(&self, state: ConnectivityState) {
        let entered = {
            let mut session = self.core.session.lock();
            match session.state() {
                SessionState::Connected => {
                    session.set_online(false);
                    session
                        .transition(SessionState::TransientlyDisconnected, "connectivity degraded")
                        .is_ok()
                }
                SessionState::TransientlyDisconnected => {
                    session.set_online(false);
                    false
                }
                other => {
                    debug!("Ignoring {:?} while {}", state, other);
                    return;
                }
            }
        };

        if entered {
            warn!("Connection problem: transport is {:?}", state);
            self.core.notifier.emit_connection_problem();
        }
        ConnectionHealthMonitor::new(self.core.clone()).start(state);
        if state == ConnectivityState::Disconnected {
            ReconnectionScheduler::new(self.core.clone()).start();
        }
    }

    fn on_established(&self) {
        let recovered = {
            let mut session = self.core.session.lock();
            if session.state() != SessionState::TransientlyDisconnected {
                return;
            }
            let restored = session
                .transition(SessionState::Connected, "connectivity restored")
                .is_ok();
            if restored {
                session.set_online(true);
            }
            restored
        };
        if recovered {
            info!("Connection recovered");
            self.core.notifier.emit_connection_recovered();
        }
    }

    // ---------- driver ----------

    /// Processes relay messages and transport events, each stream in arrival order,
    /// until the session is closed. The relay subscription is dropped on exit.
    pub async fn run(
        &self,
        mut subscription: RelaySubscription,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let relay_loop = async move {
            let closed = wait_closed(self.watch_state());
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    message = subscription.recv() => match message {
                        Some(message) => {
                            let event = message.event_name();
                            if let Err(e) = self.handle_message(message).await {
                                log_handler_error(event, &e);
                            }
                        }
                        None => {
                            warn!("Relay subscription ended");
                            break;
                        }
                    },
                }
            }
            drop(subscription);
        };

        let transport_loop = async move {
            let closed = wait_closed(self.watch_state());
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    event = transport_events.recv() => match event {
                        Some(event) => {
                            if let Err(e) = self.handle_transport_event(event).await {
                                log_handler_error("transport event", &e);
                            }
                        }
                        None => break,
                    },
                }
            }
        };

        tokio::join!(relay_loop, transport_loop);
        info!("Call session {} finished", self.id());
    }
}

async fn wait_closed(mut state: watch::Receiver<SessionState>) {
    // sender живёт в Notifier столько же, сколько сессия
    let _ = state
        .wait_for(|s| *s == SessionState::Closed)
        .await
        .map(|_| ());
}

fn log_handler_error(what: &str, e: &CallError) {
    if e.is_recoverable() {
        debug!("{} ignored: {}", what, e);
    } else {
        warn!("{} failed: {}", what, e);
    }
}
