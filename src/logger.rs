use crate::peer::types::InboundByteCounts;
use crate::session::{CloseReason, SessionState};
use log::{debug, LevelFilter};
use std::io::Write;
use tokio::sync::{broadcast, watch};

/// Инициализация логирования с временными метками
pub fn init_logger(level: &str) {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED {
        return;
    }
    #[cfg(debug_assertions)]
    {
        // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
        if !crate::config::dev::ENABLE_LOGGING {
            return;
        }
    }

    let filters = log_filters(level, std::env::var("ROOMCALL_LOG").ok());
    let _ = env_logger::Builder::new()
        .parse_filters(&filters)
        .filter_module("webrtc_ice", LevelFilter::Error)
        .filter_module("webrtc_dtls", LevelFilter::Error)
        .filter_module("webrtc_mdns", LevelFilter::Error)
        .filter_module("webrtc_sctp", LevelFilter::Error)
        .format(|buf, record| {
            let now = chrono::Local::now();
            writeln!(
                buf,
                "RUST: [{}] {} {}: {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

/// `ROOMCALL_LOG` перекрывает уровень из конфигурации
fn log_filters(level: &str, env_override: Option<String>) -> String {
    env_override
        .filter(|filters| !filters.trim().is_empty())
        .unwrap_or_else(|| level.to_string())
}

/// Быстрый снимок входящих счётчиков
pub fn dump_inbound_stats(moment: &str, counts: &InboundByteCounts) {
    debug!(
        "STATS {moment}: inbound audio={} bytes video={} bytes",
        counts.audio, counts.video
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    LocalStreamReady {
        stream_id: String,
    },
    RemoteStreamAttached {
        stream_id: String,
        track_count: usize,
    },
    RenegotiationStarted {
        ice_restart: bool,
    },
    RenegotiationCoalesced,
    RenegotiationCompleted,
    ConnectionProblem,
    ConnectionRecovering,
    ConnectionRecovered,
    ConnectionFailed,
    Closed {
        reason: CloseReason,
    },
}

const EVENT_BUFFER: usize = 64;

/// Раздаёт события сессии наружу (UI и т.п.)
pub struct Notifier {
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(SessionState::Idle);
        Self { events, state }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        debug!("emit: {:?}", event);
        // нет подписчиков, это не ошибка
        let _ = self.events.send(event);
    }

    pub fn emit_transition(&self, from: SessionState, to: SessionState) {
        self.state.send_replace(to);
        self.emit(SessionEvent::StateChanged { from, to });
    }

    pub fn emit_local_stream(&self, stream_id: &str) {
        self.emit(SessionEvent::LocalStreamReady {
            stream_id: stream_id.to_owned(),
        });
    }

    pub fn emit_remote_stream(&self, stream_id: &str, track_count: usize) {
        self.emit(SessionEvent::RemoteStreamAttached {
            stream_id: stream_id.to_owned(),
            track_count,
        });
    }

    pub fn emit_renegotiation_started(&self, ice_restart: bool) {
        self.emit(SessionEvent::RenegotiationStarted { ice_restart });
    }

    pub fn emit_renegotiation_coalesced(&self) {
        self.emit(SessionEvent::RenegotiationCoalesced);
    }

    pub fn emit_renegotiation_completed(&self) {
        self.emit(SessionEvent::RenegotiationCompleted);
    }

    pub fn emit_connection_problem(&self) {
        self.emit(SessionEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovering(&self) {
        self.emit(SessionEvent::ConnectionRecovering);
    }

    pub fn emit_connection_recovered(&self) {
        self.emit(SessionEvent::ConnectionRecovered);
    }

    pub fn emit_connection_failed(&self) {
        self.emit(SessionEvent::ConnectionFailed);
    }

    pub fn emit_closed(&self, reason: CloseReason) {
        self.emit(SessionEvent::Closed { reason });
    }
}
