use crate::error::{CallError, Result};
use crate::peer::state::CallCore;
use crate::peer::types::{PeerId, SessionDescription};
use crate::session::{PendingExchange, Role, Session, SessionState};
use crate::signaling::OutboundMessage;
use log::{debug, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Started,
    /// Другой обмен уже идёт, запрос поглощён им
    Coalesced,
}

/// Offer/answer and renegotiation protocol against the single remote peer.
pub struct NegotiationCoordinator {
    core: Arc<CallCore>,
}

impl NegotiationCoordinator {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        Self { core }
    }

    /// A-сторона: захват медиа, offer, `user:call`
    pub async fn initiate_call(&self, to: PeerId) -> Result<()> {
        ensure_fresh(&self.core.session.lock(), "initiate_call")?;
        self.ensure_local_media().await?;

        {
            let mut session = self.core.session.lock();
            ensure_fresh(&session, "initiate_call")?;
            session.set_remote_peer(to.clone());
            session.set_role(Role::Caller);
            session.transition(SessionState::Calling, "initiate_call")?;
            session.reserve(PendingExchange::CallOffer);
        }

        let exchange = PendingExchange::CallOffer;
        let offer = self
            .make_offer(false)
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            ensure_pending(&session, exchange, "initiate_call")?;
            session.mark_local_description();
            session.transition(SessionState::Negotiating, "initiate_call")?;
        }

        info!("Calling {} (offer {})", to, offer.fingerprint());
        self.core
            .send(OutboundMessage::CallRequest { to, offer })
            .await
            .map_err(|e| self.abandon(exchange, e))
    }

    /// B-сторона: применяем offer, отвечаем `call:accepted`
    pub async fn handle_incoming_call(&self, from: PeerId, offer: SessionDescription) -> Result<()> {
        ensure_fresh(&self.core.session.lock(), "handle_incoming_call")?;
        self.ensure_local_media().await?;

        {
            let mut session = self.core.session.lock();
            ensure_fresh(&session, "handle_incoming_call")?;
            session.set_remote_peer(from.clone());
            session.set_role(Role::Callee);
            session.transition(SessionState::Calling, "handle_incoming_call")?;
            session.reserve(PendingExchange::AnsweringCall);
        }
        info!("Incoming call from {} (offer {})", from, offer.fingerprint());

        let exchange = PendingExchange::AnsweringCall;
        let answer = self
            .make_answer(offer)
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            finish(&mut session, exchange, "handle_incoming_call")?;
            session.mark_local_description();
            session.transition(SessionState::Connected, "handle_incoming_call")?;
        }

        info!("Accepting call from {} (answer {})", from, answer.fingerprint());
        self.core
            .send(OutboundMessage::CallAccept { to: from, ans: answer })
            .await
    }

    /// A-сторона: применяем answer и сразу отправляем свои треки
    pub async fn handle_call_accepted(&self, from: PeerId, answer: SessionDescription) -> Result<()> {
        let exchange = PendingExchange::CallOffer;
        {
            let session = self.core.session.lock();
            if session.pending() != Some(exchange) {
                return Err(CallError::DescriptionMismatch);
            }
            if session.remote_peer_id() != Some(&from) {
                warn!("Answer from {} who was never called", from);
                return Err(CallError::DescriptionMismatch);
            }
        }

        self.core
            .transport
            .set_remote_description(answer)
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            finish(&mut session, exchange, "handle_call_accepted")?;
            session.transition(SessionState::Connected, "handle_call_accepted")?;
        }
        info!("Call accepted by {}", from);

        self.send_streams().await?;
        Ok(())
    }

    /// Adds the local tracks to the transport, once per session. Returns how many were added.
    pub async fn send_streams(&self) -> Result<usize> {
        let tracks = {
            let mut session = self.core.session.lock();
            let state = session.state();
            if state.is_terminal() || state == SessionState::Idle {
                return Err(CallError::invalid_state("send_streams", state));
            }
            session.take_tracks_for_attach()
        };
        let Some(tracks) = tracks else {
            debug!("Local tracks already sent");
            return Ok(0);
        };

        for track in &tracks {
            self.core.transport.add_track(track).await?;
        }
        info!("Sent {} local tracks", tracks.len());
        Ok(tracks.len())
    }

    pub async fn handle_negotiation_needed(&self) -> Result<NegotiationOutcome> {
        self.renegotiate(false, "handle_negotiation_needed").await
    }

    /// Renegotiation with fresh ICE credentials.
    pub async fn restart_ice(&self) -> Result<NegotiationOutcome> {
        self.renegotiate(true, "restart_ice").await
    }

    async fn renegotiate(&self, ice_restart: bool, operation: &'static str) -> Result<NegotiationOutcome> {
        let exchange = PendingExchange::Renegotiation { ice_restart };
        let (peer, polite, ticket) = {
            let mut session = self.core.session.lock();
            if let Some(outstanding) = session.pending() {
                let total = session.note_coalesced();
                debug!(
                    "{} coalesced into outstanding {:?} ({} so far)",
                    operation, outstanding, total
                );
                self.core.notifier.emit_renegotiation_coalesced();
                return Ok(NegotiationOutcome::Coalesced);
            }
            let state = session.state();
            if !state.is_connected_eligible() {
                return Err(CallError::invalid_state(operation, state));
            }
            let Some(peer) = session.remote_peer_id().cloned() else {
                return Err(CallError::invalid_state(operation, state));
            };
            let ticket = session.reserve(exchange);
            (peer, session.role() == Some(Role::Callee), ticket)
        };
        self.core.notifier.emit_renegotiation_started(ice_restart);

        // вежливая сторона применяет свой offer только вместе с ответом
        let offer = if polite {
            self.core.transport.create_offer(ice_restart).await
        } else {
            self.make_offer(ice_restart).await
        }
        .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            if !session.holds_exchange(ticket) {
                debug!("{}: offer withdrawn before it was sent", operation);
                return Err(CallError::invalid_state(operation, session.state()));
            }
            if polite {
                session.hold_offer(offer.clone());
            } else {
                session.mark_local_description();
            }
        }

        info!(
            "Renegotiating with {} (ice_restart={}, offer {})",
            peer,
            ice_restart,
            offer.fingerprint()
        );
        self.core
            .send(OutboundMessage::RenegotiationOffer { to: peer, offer })
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        Ok(NegotiationOutcome::Started)
    }

    pub async fn handle_incoming_renegotiation(
        &self,
        from: PeerId,
        offer: SessionDescription,
    ) -> Result<()> {
        let operation = "handle_incoming_renegotiation";
        let exchange = PendingExchange::AnsweringRenegotiation;
        let superseded = {
            let mut session = self.core.session.lock();
            let state = session.state();
            if !state.is_connected_eligible() || session.remote_peer_id() != Some(&from) {
                return Err(CallError::invalid_state(operation, state));
            }
            let superseded = match session.pending() {
                None => None,
                // вежливая сторона уступает, её offer ещё не применён
                Some(PendingExchange::Renegotiation { ice_restart })
                    if session.role() == Some(Role::Callee) && session.offer_withdrawable() =>
                {
                    Some(ice_restart)
                }
                Some(outstanding) => {
                    warn!(
                        "Renegotiation glare with {}, keeping our {:?}",
                        from, outstanding
                    );
                    return Err(CallError::invalid_state(operation, state));
                }
            };
            session.reserve(exchange);
            superseded
        };
        if superseded.is_some() {
            info!("Renegotiation glare with {}, dropping our unapplied offer", from);
        }

        let answer = self
            .make_answer(offer)
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            finish(&mut session, exchange, operation)?;
        }
        self.core.notifier.emit_renegotiation_completed();

        info!("Renegotiation answer to {} ({})", from, answer.fingerprint());
        self.core
            .send(OutboundMessage::RenegotiationAnswer { to: from, ans: answer })
            .await?;

        if let Some(ice_restart) = superseded {
            // отброшенный запрос ещё не выполнен
            if let Err(e) = self.renegotiate(ice_restart, "renegotiation after glare").await {
                warn!("Re-issuing our renegotiation failed: {}", e);
            }
        }
        Ok(())
    }

    pub async fn handle_final_renegotiation_answer(
        &self,
        from: Option<PeerId>,
        answer: SessionDescription,
    ) -> Result<()> {
        let (exchange, held) = {
            let mut session = self.core.session.lock();
            let exchange = match session.pending() {
                Some(exchange @ PendingExchange::Renegotiation { .. }) => exchange,
                _ => return Err(CallError::DescriptionMismatch),
            };
            if from.is_some() && from.as_ref() != session.remote_peer_id() {
                return Err(CallError::DescriptionMismatch);
            }
            (exchange, session.start_answer_apply())
        };

        if let Some(offer) = held {
            self.core
                .transport
                .set_local_description(offer)
                .await
                .map_err(|e| self.abandon(exchange, e))?;
        }
        self.core
            .transport
            .set_remote_description(answer)
            .await
            .map_err(|e| self.abandon(exchange, e))?;
        {
            let mut session = self.core.session.lock();
            finish(&mut session, exchange, "handle_final_renegotiation_answer")?;
        }
        info!("Renegotiation complete");
        self.core.notifier.emit_renegotiation_completed();
        Ok(())
    }

    async fn make_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let transport = &self.core.transport;
        let offer = transport.create_offer(ice_restart).await?;
        transport.set_local_description(offer.clone()).await?;
        // после сбора кандидатов локальное описание уже содержит их
        Ok(transport.local_description().await.unwrap_or(offer))
    }

    async fn make_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let transport = &self.core.transport;
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        Ok(transport.local_description().await.unwrap_or(answer))
    }

    async fn ensure_local_media(&self) -> Result<()> {
        if self.core.session.lock().local_stream().is_some() {
            return Ok(());
        }
        let stream = self.core.media.acquire().await.map_err(|e| {
            warn!("Local media acquisition failed: {}", e);
            CallError::from(e)
        })?;

        let rejected = self.core.session.lock().set_local_stream(stream);
        if let Err(stream) = rejected {
            // параллельный захват успел раньше, либо сессия закрыта
            self.core.media.release(stream);
            let state = self.core.session.lock().state();
            if state == SessionState::Closed {
                return Err(CallError::invalid_state("acquire local media", state));
            }
        }
        Ok(())
    }

    fn abandon(&self, exchange: PendingExchange, err: CallError) -> CallError {
        let mut session = self.core.session.lock();
        if session.pending() == Some(exchange) {
            session.clear_pending();
        }
        warn!("Abandoning {:?}: {}", exchange, err);
        err
    }
}

fn ensure_fresh(session: &Session, operation: &'static str) -> Result<()> {
    let state = session.state();
    let fresh = matches!(state, SessionState::Idle | SessionState::Calling)
        && !session.has_local_description()
        && session.pending().is_none();
    if fresh {
        Ok(())
    } else {
        Err(CallError::invalid_state(operation, state))
    }
}

/// Обмен мог быть вытеснен (откат, закрытие), пока мы ждали transport
fn ensure_pending(session: &Session, exchange: PendingExchange, operation: &'static str) -> Result<()> {
    if session.pending() == Some(exchange) {
        Ok(())
    } else {
        Err(CallError::invalid_state(operation, session.state()))
    }
}

fn finish(session: &mut Session, exchange: PendingExchange, operation: &'static str) -> Result<()> {
    ensure_pending(session, exchange, operation)?;
    session.clear_pending();
    Ok(())
}
