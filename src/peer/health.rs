//! Liveness check for a degraded connection.
//!
//! ICE reports `disconnected`/`failed` for short NAT rebinding blips as
//! readily as for a lost peer. The only trusted signal is whether inbound
//! RTP byte counters keep growing: two samples one recheck interval apart.

use crate::logger::dump_inbound_stats;
use crate::peer::negotiation::NegotiationCoordinator;
use crate::peer::state::CallCore;
use crate::peer::types::{ConnectivityState, InboundByteCounts};
use crate::session::{CloseReason, SessionState};
use log::{info, warn};
use std::sync::Arc;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub audio_bytes_received: u64,
    pub video_bytes_received: u64,
    pub liveness: Liveness,
    pub taken_at: Instant,
}

impl HealthSample {
    pub fn counts(&self) -> InboundByteCounts {
        InboundByteCounts {
            audio: self.audio_bytes_received,
            video: self.video_bytes_received,
        }
    }
}

/// Last two samples of the current check. Lives inside the session.
#[derive(Debug, Default, Clone)]
pub struct HealthHistory {
    previous: Option<HealthSample>,
    latest: Option<HealthSample>,
}

impl HealthHistory {
    /// Новая проверка начинает с нулевой базы
    pub fn reset(&mut self) {
        self.previous = None;
        self.latest = None;
    }

    pub fn record(&mut self, counts: InboundByteCounts) -> Liveness {
        let baseline = self.latest.map(|s| s.counts()).unwrap_or_default();
        // любой вид медиа, который ещё растёт, значит соединение живо
        let audio_alive = counts.audio > baseline.audio;
        let video_alive = counts.video > baseline.video;
        let liveness = if audio_alive || video_alive {
            Liveness::Alive
        } else {
            Liveness::Stale
        };

        self.previous = self.latest.take();
        self.latest = Some(HealthSample {
            audio_bytes_received: counts.audio,
            video_bytes_received: counts.video,
            liveness,
            taken_at: Instant::now(),
        });
        liveness
    }

    pub fn latest(&self) -> Option<HealthSample> {
        self.latest
    }

    pub fn samples(&self) -> Vec<HealthSample> {
        self.previous.into_iter().chain(self.latest).collect()
    }
}

pub struct ConnectionHealthMonitor {
    core: Arc<CallCore>,
}

impl ConnectionHealthMonitor {
    pub(crate) fn new(core: Arc<CallCore>) -> Self {
        Self { core }
    }

    /// Starts a check for `trigger` unless one for the same trigger is running.
    pub fn start(&self, trigger: ConnectivityState) {
        if !trigger.is_degraded() {
            return;
        }
        let mut session = self.core.session.lock();
        if session.state() != SessionState::TransientlyDisconnected {
            return;
        }
        if session.running_health_check() == Some(trigger) {
            info!("Health check for {:?} already running", trigger);
            return;
        }

        let epoch = session.next_epoch();
        session.health_mut().reset();
        let core = self.core.clone();
        let handle = tokio::spawn(async move { run_check(core, epoch, trigger).await });
        session.set_health_task(epoch, trigger, handle);
    }
}

async fn run_check(core: Arc<CallCore>, epoch: u64, trigger: ConnectivityState) {
    info!("Health check started for {:?}", trigger);
    if take_sample(&core, epoch, "first").await.is_none() {
        return;
    }
    sleep(core.config.health_recheck_interval()).await;
    let Some(verdict) = take_sample(&core, epoch, "second").await else {
        return;
    };

    match (trigger, verdict) {
        (ConnectivityState::Disconnected, Liveness::Stale) => {
            declare_permanent(&core, epoch).await;
        }
        (ConnectivityState::Disconnected, Liveness::Alive) => {
            info!("Media still flowing while disconnected, leaving recovery to reconnection");
            core.notifier.emit_connection_recovering();
            core.session.lock().detach_health(epoch);
        }
        (ConnectivityState::Failed, Liveness::Alive) => {
            info!("Spurious failed report, media still flowing");
            core.session.lock().detach_health(epoch);
        }
        (ConnectivityState::Failed, Liveness::Stale) => {
            restart_and_confirm(&core, epoch).await;
        }
        _ => {}
    }
}

/// `None` once the check has been superseded or its state left.
async fn take_sample(core: &CallCore, epoch: u64, moment: &str) -> Option<Liveness> {
    let counts = match core.transport.inbound_bytes().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            warn!("Failed to read inbound stats: {}", e);
            None
        }
    };

    let mut session = core.session.lock();
    if !session.is_health_current(epoch) {
        return None;
    }
    // без статистики считаем, что счётчики не сдвинулись
    let counts = counts
        .or_else(|| session.health().latest().map(|s| s.counts()))
        .unwrap_or_default();
    dump_inbound_stats(moment, &counts);
    Some(session.health_mut().record(counts))
}

async fn restart_and_confirm(core: &Arc<CallCore>, epoch: u64) {
    info!("No media on failed connection, restarting ICE");
    if let Err(e) = NegotiationCoordinator::new(core.clone()).restart_ice().await {
        warn!("ICE restart failed: {}", e);
    }
    {
        let mut session = core.session.lock();
        if !session.is_health_current(epoch) {
            return;
        }
        session.set_online(true);
    }
    core.notifier.emit_connection_recovering();

    sleep(core.config.ice_restart_grace()).await;
    match take_sample(core, epoch, "after-restart").await {
        Some(Liveness::Stale) => declare_permanent(core, epoch).await,
        Some(Liveness::Alive) => {
            info!("Media resumed after ICE restart");
            core.session.lock().detach_health(epoch);
        }
        None => {}
    }
}

async fn declare_permanent(core: &CallCore, epoch: u64) {
    {
        let mut session = core.session.lock();
        if !session.is_health_current(epoch) {
            return;
        }
        session.detach_health(epoch);
        if let Err(e) = session.transition(SessionState::PermanentlyDisconnected, "health check") {
            warn!("Cannot declare permanent disconnect: {}", e);
            return;
        }
    }
    warn!("No inbound media across the recheck window, hanging up");
    core.notifier.emit_connection_failed();
    core.terminate(CloseReason::PermanentDisconnect).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(audio: u64, video: u64) -> InboundByteCounts {
        InboundByteCounts { audio, video }
    }

    #[test]
    fn either_kind_growing_is_alive() {
        let mut history = HealthHistory::default();
        history.record(counts(100, 100));
        assert_eq!(history.record(counts(100, 150)), Liveness::Alive);
        assert_eq!(history.record(counts(180, 150)), Liveness::Alive);
    }

    #[test]
    fn flat_counters_are_stale() {
        let mut history = HealthHistory::default();
        history.record(counts(500, 900));
        assert_eq!(history.record(counts(500, 900)), Liveness::Stale);
    }

    #[test]
    fn first_sample_compares_against_zero() {
        let mut history = HealthHistory::default();
        assert_eq!(history.record(counts(0, 0)), Liveness::Stale);
        history.reset();
        assert_eq!(history.record(counts(0, 1)), Liveness::Alive);
    }

    #[test]
    fn keeps_only_two_samples() {
        let mut history = HealthHistory::default();
        for n in 1..=5 {
            history.record(counts(n, 0));
        }
        let samples = history.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].audio_bytes_received, 4);
        assert_eq!(samples[1].audio_bytes_received, 5);
    }
}
