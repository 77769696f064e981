use crate::config::SessionConfig;
use crate::error::{CallError, Result};
use crate::media::LocalTrack;
use crate::peer::types::{
    ConnectivityState, InboundByteCounts, MediaKind, RemoteTrack, SdpKind, ServerConfig,
    SessionDescription, TransportEvent,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_connection_state::RTCIceConnectionState, ice_server::RTCIceServer},
    peer_connection::{
        configuration::RTCConfiguration, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
};

/// Максимальное ожидание сбора кандидатов перед отправкой описания
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// The peer-connection primitive the session drives.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn inbound_bytes(&self) -> Result<InboundByteCounts>;

    fn connectivity_state(&self) -> ConnectivityState;

    async fn close(&self) -> Result<()>;

    async fn reapply_local_description(&self) -> Result<()> {
        match self.local_description().await {
            Some(desc) => self.set_local_description(desc).await,
            None => Err(CallError::Transport(
                "no local description to re-apply".into(),
            )),
        }
    }

    async fn reapply_remote_description(&self) -> Result<()> {
        match self.remote_description().await {
            Some(desc) => self.set_remote_description(desc).await,
            None => Err(CallError::Transport(
                "no remote description to re-apply".into(),
            )),
        }
    }
}

fn transport_err(e: webrtc::Error) -> CallError {
    CallError::Transport(e.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let kind = desc.kind;
    let rtc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    };
    rtc.map_err(|e| CallError::DescriptionApply {
        kind,
        reason: e.to_string(),
    })
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return None,
    };
    Some(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

/// webrtc-rs backed transport.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    /// создаём Peer и пробрасываем его события в канал
    pub async fn new(
        config: &SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&config.ice_servers))
                .await
                .map_err(transport_err)?,
        );

        // принимаем звук и видео собеседника ещё до добавления своих треков
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(transport_err)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let state_tx = tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            info!("*** ICE connection state changed to ==> {}", st);
            let _ = state_tx.send(TransportEvent::ConnectivityChanged(st.into()));
            Box::pin(async {})
        }));

        let nego_tx = tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            debug!("negotiationneeded fired");
            let _ = nego_tx.send(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let track_tx = tx;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if let Some(kind) = MediaKind::from_codec_type(track.kind()) {
                info!("GOT TRACK {} ({:?})", track.id(), kind);
                let _ = track_tx.send(TransportEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    handle: Some(track.clone()),
                }));
            }
            Box::pin(async {})
        }));

        Ok((Self { pc }, rx))
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(transport_err)?;
        from_rtc(offer).ok_or_else(|| CallError::Transport("offer without type".into()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        from_rtc(answer).ok_or_else(|| CallError::Transport("answer without type".into()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let kind = desc.kind;
        let rtc = to_rtc(desc)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| CallError::DescriptionApply {
                kind,
                reason: e.to_string(),
            })?;

        // relay не передаёт trickle-кандидаты: ждём их в самом SDP
        if kind != SdpKind::Rollback && timeout(GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            warn!(
                "ICE gathering not complete after {} s, sending partial candidates",
                GATHER_TIMEOUT.as_secs()
            );
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let kind = desc.kind;
        let rtc = to_rtc(desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| CallError::DescriptionApply {
                kind,
                reason: e.to_string(),
            })
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.and_then(from_rtc)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.track.clone();
        self.pc.add_track(local).await.map_err(transport_err)?;
        Ok(())
    }

    async fn inbound_bytes(&self) -> Result<InboundByteCounts> {
        let stats = self.pc.get_stats().await;
        let mut counts = InboundByteCounts::default();
        for (_, report) in stats.reports {
            if let StatsReportType::InboundRTP(inbound) = report {
                let kind: &str = &inbound.kind;
                match kind {
                    "audio" => counts.audio += inbound.bytes_received,
                    "video" => counts.video += inbound.bytes_received,
                    _ => {}
                }
            }
        }
        Ok(counts)
    }

    fn connectivity_state(&self) -> ConnectivityState {
        self.pc.ice_connection_state().into()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(transport_err)
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_maps_without_sdp() {
        let rtc = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);
    }

    #[test]
    fn unspecified_description_is_dropped() {
        assert!(from_rtc(RTCSessionDescription::default()).is_none());
    }

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let servers = vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        }];
        let ice = get_user_ice_servers(&servers);
        assert_eq!(ice[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(ice[0].username, "user");
        assert_eq!(ice[0].credential, "secret");
    }
}
