use crate::error::{CallError, Result};
use crate::logger::Notifier;
use crate::media::{LocalStream, LocalTrack};
use crate::peer::health::HealthHistory;
use crate::peer::types::{
    ConnectivityState, PeerId, RemoteStream, RemoteTrack, SessionDescription,
};
use crate::utils::random_id;
use log::{debug, info};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Calling,
    Negotiating,
    Connected,
    TransientlyDisconnected,
    PermanentlyDisconnected,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::PermanentlyDisconnected | SessionState::Closed
        )
    }

    /// Оба описания применены, медиа собеседника можно показывать
    pub fn is_connected_eligible(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::TransientlyDisconnected
        )
    }

    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Calling) => true,
            (Calling, Negotiating) | (Calling, Connected) | (Negotiating, Connected) => true,
            (Connected, TransientlyDisconnected) => true,
            (TransientlyDisconnected, Connected) => true,
            (TransientlyDisconnected, PermanentlyDisconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Original offerer/answerer role, kept for re-applying descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Незавершённый обмен описаниями (не больше одного за раз)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingExchange {
    CallOffer,
    AnsweringCall,
    Renegotiation { ice_restart: bool },
    AnsweringRenegotiation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    LocalHangup,
    RemoteHangup,
    TransportClosed,
    PermanentDisconnect,
}

/// То, что нужно освободить после перехода в `Closed`
#[derive(Debug)]
pub struct CloseResources {
    pub from: SessionState,
    pub local_stream: Option<LocalStream>,
    pub notify_peer: Option<PeerId>,
}

struct ScheduledTask {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Default)]
struct SessionTasks {
    next_epoch: u64,
    health: Option<ScheduledTask>,
    health_trigger: Option<ConnectivityState>,
    reconnect: Option<ScheduledTask>,
}

impl SessionTasks {
    fn cancel_all(&mut self) {
        for task in [self.health.take(), self.reconnect.take()].into_iter().flatten() {
            debug!("Aborting scheduled task epoch={}", task.epoch);
            task.handle.abort();
        }
    }
}

/// One call attempt with one remote peer.
pub struct Session {
    id: String,
    state: SessionState,
    remote_peer_id: Option<PeerId>,
    role: Option<Role>,
    local_stream: Option<LocalStream>,
    local_tracks_attached: bool,
    remote_stream: Option<RemoteStream>,
    pending_remote_tracks: Vec<RemoteTrack>,
    has_local_description: bool,
    pending: Option<PendingExchange>,
    exchange_ticket: u64,
    /// Offer sent to the peer but not yet applied locally
    held_offer: Option<SessionDescription>,
    applying_answer: bool,
    coalesced: u32,
    health: HealthHistory,
    online: bool,
    tasks: SessionTasks,
    notifier: Arc<Notifier>,
}

impl Session {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            id: random_id(),
            state: SessionState::Idle,
            remote_peer_id: None,
            role: None,
            local_stream: None,
            local_tracks_attached: false,
            remote_stream: None,
            pending_remote_tracks: Vec::new(),
            has_local_description: false,
            pending: None,
            exchange_ticket: 0,
            held_offer: None,
            applying_answer: false,
            coalesced: 0,
            health: HealthHistory::default(),
            online: true,
            tasks: SessionTasks::default(),
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn remote_peer_id(&self) -> Option<&PeerId> {
        self.remote_peer_id.as_ref()
    }

    pub fn set_remote_peer(&mut self, peer: PeerId) {
        self.remote_peer_id = Some(peer);
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn set_role(&mut self, role: Role) {
        self.role = Some(role);
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    /// Отдаёт поток обратно, если сессия уже владеет другим
    pub fn set_local_stream(&mut self, stream: LocalStream) -> std::result::Result<(), LocalStream> {
        if self.local_stream.is_some() || self.state == SessionState::Closed {
            return Err(stream);
        }
        self.notifier.emit_local_stream(&stream.id);
        self.local_stream = Some(stream);
        Ok(())
    }

    /// Tracks to hand to the transport, at most once per session.
    pub fn take_tracks_for_attach(&mut self) -> Option<Vec<LocalTrack>> {
        if self.local_tracks_attached {
            return None;
        }
        let tracks = self.local_stream.as_ref()?.tracks.clone();
        self.local_tracks_attached = true;
        Some(tracks)
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Returns true when the track became visible on the remote stream.
    pub fn add_remote_track(&mut self, track: RemoteTrack) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        if !self.state.is_connected_eligible() {
            debug!("Remote track {} buffered until connected", track.id);
            self.pending_remote_tracks.push(track);
            return false;
        }
        self.attach_remote_tracks(vec![track]);
        true
    }

    fn attach_remote_tracks(&mut self, tracks: Vec<RemoteTrack>) {
        if tracks.is_empty() {
            return;
        }
        let stream = self.remote_stream.get_or_insert_with(|| RemoteStream {
            id: tracks[0].stream_id.clone(),
            tracks: Vec::new(),
        });
        stream.tracks.extend(tracks);
        self.notifier
            .emit_remote_stream(&stream.id, stream.tracks.len());
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn mark_local_description(&mut self) {
        self.has_local_description = true;
    }

    pub fn pending(&self) -> Option<PendingExchange> {
        self.pending
    }

    /// Claims the single exchange slot. The ticket tells a later step whether
    /// the slot is still its own.
    pub fn reserve(&mut self, exchange: PendingExchange) -> u64 {
        self.clear_pending();
        self.exchange_ticket += 1;
        self.pending = Some(exchange);
        self.exchange_ticket
    }

    pub fn holds_exchange(&self, ticket: u64) -> bool {
        self.pending.is_some() && self.exchange_ticket == ticket
    }

    pub fn clear_pending(&mut self) -> Option<PendingExchange> {
        self.held_offer = None;
        self.applying_answer = false;
        self.pending.take()
    }

    pub fn hold_offer(&mut self, offer: SessionDescription) {
        self.held_offer = Some(offer);
    }

    /// The answer to our renegotiation arrived: from here on the offer cannot be withdrawn.
    pub fn start_answer_apply(&mut self) -> Option<SessionDescription> {
        self.applying_answer = true;
        self.held_offer.take()
    }

    /// Our renegotiation offer is not on the transport yet and can be dropped.
    pub fn offer_withdrawable(&self) -> bool {
        matches!(self.pending, Some(PendingExchange::Renegotiation { .. })) && !self.applying_answer
    }

    pub fn is_renegotiating(&self) -> bool {
        matches!(
            self.pending,
            Some(PendingExchange::Renegotiation { .. } | PendingExchange::AnsweringRenegotiation)
        )
    }

    pub fn note_coalesced(&mut self) -> u32 {
        self.coalesced += 1;
        self.coalesced
    }

    pub fn coalesced(&self) -> u32 {
        self.coalesced
    }

    pub fn health(&self) -> &HealthHistory {
        &self.health
    }

    pub fn health_mut(&mut self) -> &mut HealthHistory {
        &mut self.health
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    pub fn transition(&mut self, to: SessionState, operation: &'static str) -> Result<()> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if to == SessionState::Closed || !from.can_transition_to(to) {
            return Err(CallError::invalid_state(operation, from));
        }

        // таймеры живут только пока сессия в состоянии, которое их запустило
        if from == SessionState::TransientlyDisconnected {
            self.tasks.cancel_all();
        }
        self.state = to;
        info!("Session {} state {} -> {}", self.id, from, to);
        self.notifier.emit_transition(from, to);

        if to == SessionState::Connected {
            let tracks = std::mem::take(&mut self.pending_remote_tracks);
            self.attach_remote_tracks(tracks);
        }
        Ok(())
    }

    /// Enters `Closed`. Only the first call yields the resources to release.
    pub fn close(&mut self, reason: CloseReason) -> Option<CloseResources> {
        let from = self.state;
        if from == SessionState::Closed {
            debug!("Session {} already closed, ignoring {:?}", self.id, reason);
            return None;
        }

        self.tasks.cancel_all();
        self.state = SessionState::Closed;
        info!("Session {} state {} -> Closed ({:?})", self.id, from, reason);
        self.notifier.emit_transition(from, SessionState::Closed);

        let notify_peer = match reason {
            CloseReason::RemoteHangup | CloseReason::TransportClosed => None,
            CloseReason::LocalHangup | CloseReason::PermanentDisconnect => {
                self.remote_peer_id.clone()
            }
        };
        self.remote_peer_id = None;
        self.remote_stream = None;
        self.pending_remote_tracks.clear();
        self.clear_pending();
        self.health.reset();
        self.online = false;

        Some(CloseResources {
            from,
            local_stream: self.local_stream.take(),
            notify_peer,
        })
    }

    // ---------- scheduled tasks ----------

    pub fn next_epoch(&mut self) -> u64 {
        self.tasks.next_epoch += 1;
        self.tasks.next_epoch
    }

    pub fn set_health_task(
        &mut self,
        epoch: u64,
        trigger: ConnectivityState,
        handle: JoinHandle<()>,
    ) {
        self.tasks.health_trigger = Some(trigger);
        if let Some(old) = self.tasks.health.replace(ScheduledTask { epoch, handle }) {
            debug!("Superseding health check epoch={}", old.epoch);
            old.handle.abort();
        }
    }

    pub fn set_reconnect_task(&mut self, epoch: u64, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks.reconnect.replace(ScheduledTask { epoch, handle }) {
            old.handle.abort();
        }
    }

    /// Trigger of the health check still in flight, if any.
    pub fn running_health_check(&self) -> Option<ConnectivityState> {
        match &self.tasks.health {
            Some(task) if task.is_running() => self.tasks.health_trigger,
            _ => None,
        }
    }

    pub fn has_reconnect_task(&self) -> bool {
        self.tasks.reconnect.as_ref().is_some_and(ScheduledTask::is_running)
    }

    pub fn is_health_current(&self, epoch: u64) -> bool {
        self.state == SessionState::TransientlyDisconnected
            && self.tasks.health.as_ref().is_some_and(|t| t.epoch == epoch)
    }

    pub fn is_reconnect_current(&self, epoch: u64) -> bool {
        self.state == SessionState::TransientlyDisconnected
            && self.tasks.reconnect.as_ref().is_some_and(|t| t.epoch == epoch)
    }

    /// Drops the handle without aborting: the task is about to finish on its own.
    pub fn detach_health(&mut self, epoch: u64) {
        if self.tasks.health.as_ref().is_some_and(|t| t.epoch == epoch) {
            self.tasks.health = None;
        }
    }

    pub fn detach_reconnect(&mut self, epoch: u64) {
        if self.tasks.reconnect.as_ref().is_some_and(|t| t.epoch == epoch) {
            self.tasks.reconnect = None;
        }
    }
}
