use crate::error::MediaAcquisitionError;
use crate::peer::types::MediaKind;
use crate::utils::random_id;
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, id: &str, stream_id: &str) -> Self {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        );
        Self {
            kind,
            track: Arc::new(track),
        }
    }
}

/// Захваченное локальное медиа. Владеет им сессия до `Closed`.
#[derive(Debug)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, MediaAcquisitionError>;

    fn release(&self, stream: LocalStream);
}

/// Sample-driven tracks with no capture device behind them.
pub struct StaticSampleSource {
    pub audio: bool,
    pub video: bool,
}

impl Default for StaticSampleSource {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaSource for StaticSampleSource {
    async fn acquire(&self) -> Result<LocalStream, MediaAcquisitionError> {
        if !self.audio && !self.video {
            return Err(MediaAcquisitionError::NoDevice);
        }

        let stream_id = format!("local-{}", random_id());
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, "audio", &stream_id));
        }
        if self.video {
            tracks.push(LocalTrack::new(MediaKind::Video, "video", &stream_id));
        }
        info!("Acquired local stream {} with {} tracks", stream_id, tracks.len());
        Ok(LocalStream {
            id: stream_id,
            tracks,
        })
    }

    fn release(&self, stream: LocalStream) {
        debug!("Released local stream {}", stream.id);
    }
}
