use crate::error::{CallError, Result};
use crate::peer::types::{PeerId, SessionDescription};
use crate::utils::random_id;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ограничение распаковки (защита от zip-bomb)
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024; // 256 KiB

// ========== MESSAGES ==========

/// What the relay delivers to us.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    #[serde(rename = "user:joined")]
    PeerJoined {
        id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
    // имя события так и написано на сервере комнаты
    #[serde(rename = "incomming:call")]
    IncomingCall {
        from: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted { from: PeerId, ans: SessionDescription },
    #[serde(rename = "peer:nego:needed")]
    RenegotiationNeeded {
        from: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "peer:nego:final")]
    RenegotiationFinal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        ans: SessionDescription,
    },
    #[serde(rename = "peer:tempdisconnect")]
    TempDisconnect,
    #[serde(rename = "call:ended")]
    CallEnded { from: PeerId },
}

impl SignalingMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::PeerJoined { .. } => "user:joined",
            SignalingMessage::IncomingCall { .. } => "incomming:call",
            SignalingMessage::CallAccepted { .. } => "call:accepted",
            SignalingMessage::RenegotiationNeeded { .. } => "peer:nego:needed",
            SignalingMessage::RenegotiationFinal { .. } => "peer:nego:final",
            SignalingMessage::TempDisconnect => "peer:tempdisconnect",
            SignalingMessage::CallEnded { .. } => "call:ended",
        }
    }
}

/// What we hand to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum OutboundMessage {
    #[serde(rename = "user:call")]
    CallRequest {
        to: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "call:accepted")]
    CallAccept { to: PeerId, ans: SessionDescription },
    #[serde(rename = "peer:nego:needed")]
    RenegotiationOffer {
        to: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "peer:nego:done")]
    RenegotiationAnswer { to: PeerId, ans: SessionDescription },
    #[serde(rename = "call:ended")]
    Hangup { to: PeerId },
}

impl OutboundMessage {
    pub fn recipient(&self) -> &PeerId {
        match self {
            OutboundMessage::CallRequest { to, .. }
            | OutboundMessage::CallAccept { to, .. }
            | OutboundMessage::RenegotiationOffer { to, .. }
            | OutboundMessage::RenegotiationAnswer { to, .. }
            | OutboundMessage::Hangup { to } => to,
        }
    }

    /// Как relay переписывает сообщение для адресата
    pub fn deliver_as(self, from: PeerId) -> SignalingMessage {
        match self {
            OutboundMessage::CallRequest { offer, .. } => {
                SignalingMessage::IncomingCall { from, offer }
            }
            OutboundMessage::CallAccept { ans, .. } => SignalingMessage::CallAccepted { from, ans },
            OutboundMessage::RenegotiationOffer { offer, .. } => {
                SignalingMessage::RenegotiationNeeded { from, offer }
            }
            OutboundMessage::RenegotiationAnswer { ans, .. } => SignalingMessage::RenegotiationFinal {
                from: Some(from),
                ans,
            },
            OutboundMessage::Hangup { .. } => SignalingMessage::CallEnded { from },
        }
    }
}

// ========== WIRE CODEC ==========

/// Compact wire form of a delivered message: JSON, gzip, base64.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: String,
    pub ts: i64,
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(message: SignalingMessage) -> Self {
        Self {
            id: random_id(),
            ts: chrono::Utc::now().timestamp_millis(),
            message,
        }
    }

    pub fn encode(&self) -> Result<String> {
        // 1. JSON -> bytes
        let json = serde_json::to_vec(self).map_err(|e| CallError::Codec(e.to_string()))?;

        // 2. GZIP compress
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&json)
            .map_err(|e| CallError::Codec(e.to_string()))?;
        let compressed = gz.finish().map_err(|e| CallError::Codec(e.to_string()))?;

        // 3. base64
        Ok(general_purpose::STANDARD.encode(compressed))
    }

    pub fn decode(s: &str) -> Result<Self> {
        // 1. base64 -> bytes
        let compressed = general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| CallError::Codec(format!("base64: {e}")))?;

        // 2. gunzip с ограничением размера
        let gz = GzDecoder::new(&compressed[..]);
        let mut json = Vec::new();
        gz.take(MAX_DECOMPRESSED_SIZE + 1)
            .read_to_end(&mut json)
            .map_err(|e| CallError::Codec(format!("gzip: {e}")))?;
        if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(CallError::Codec(format!(
                "envelope exceeds {} bytes when inflated",
                MAX_DECOMPRESSED_SIZE
            )));
        }

        // 3. JSON -> struct
        serde_json::from_slice(&json).map_err(|e| CallError::Codec(format!("json: {e}")))
    }
}

// ========== RELAY ==========

/// Scoped subscription to inbound relay messages. Dropping it unsubscribes.
pub struct RelaySubscription {
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl RelaySubscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<SignalingMessage>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    fn subscribe(&self) -> Result<RelaySubscription>;

    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

type Inboxes = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<SignalingMessage>>>>;

/// In-process relay between two endpoints. Every message crosses the envelope codec.
pub struct ChannelRelay {
    me: PeerId,
    peer: PeerId,
    inboxes: Inboxes,
}

impl ChannelRelay {
    pub fn pair(a: PeerId, b: PeerId) -> (Self, Self) {
        let inboxes: Inboxes = Arc::default();
        (
            Self {
                me: a.clone(),
                peer: b.clone(),
                inboxes: inboxes.clone(),
            },
            Self {
                me: b,
                peer: a,
                inboxes,
            },
        )
    }

    pub fn local_id(&self) -> &PeerId {
        &self.me
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    /// Сообщаем второй стороне, что мы вошли в комнату
    pub fn announce_join(&self) -> Result<()> {
        self.deliver(
            &self.peer,
            SignalingMessage::PeerJoined {
                id: self.me.clone(),
                email: None,
            },
        )
    }

    fn deliver(&self, to: &PeerId, message: SignalingMessage) -> Result<()> {
        let wire = Envelope::new(message).encode()?;
        let envelope = Envelope::decode(&wire)?;
        debug!(
            "relay {} -> {}: {} ({} bytes on wire)",
            self.me,
            to,
            envelope.message.event_name(),
            wire.len()
        );

        let inboxes = self.inboxes.lock();
        let Some(inbox) = inboxes.get(to) else {
            return Err(CallError::Relay(format!("peer {to} is not connected")));
        };
        inbox
            .send(envelope.message)
            .map_err(|_| CallError::Relay(format!("peer {to} went away")))
    }
}

#[async_trait]
impl SignalingRelay for ChannelRelay {
    fn subscribe(&self) -> Result<RelaySubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inboxes = self.inboxes.lock();
            if inboxes.get(&self.me).is_some_and(|inbox| !inbox.is_closed()) {
                return Err(CallError::Relay(format!("{} is already subscribed", self.me)));
            }
            inboxes.insert(self.me.clone(), tx);
        }

        let inboxes = self.inboxes.clone();
        let me = self.me.clone();
        Ok(RelaySubscription::new(rx, move || {
            debug!("relay: {} unsubscribed", me);
            inboxes.lock().remove(&me);
        }))
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let to = message.recipient().clone();
        if to != self.peer {
            warn!("relay: {} is not in this room", to);
            return Err(CallError::Relay(format!("unknown peer {to}")));
        }
        self.deliver(&to, message.deliver_as(self.me.clone()))
    }
}
