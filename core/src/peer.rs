//! Peer connection abstraction and its `webrtc` backed implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::ice::IceConfig;
use crate::media::{MediaKind, MediaTrack};
use crate::models::{IceCandidate, SdpType, SessionDescription};

// ============================================================================
// Events
// ============================================================================

/// Connection state as observed on the native peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States that end the call.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(MediaTrack),
}

pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

// ============================================================================
// Traits
// ============================================================================

/// One negotiated media path to the remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    /// Swaps the media on an existing sender without renegotiating.
    async fn replace_track(&self, old_track_id: &str, track: &MediaTrack) -> Result<()>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription>;

    /// Creates an answer and applies it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, ice: &IceConfig, events: PeerEvents) -> Result<Arc<dyn PeerConnection>>;
}

// ============================================================================
// webrtc implementation
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, ice: &IceConfig, events: PeerEvents) -> Result<Arc<dyn PeerConnection>> {
        let peer = RtcPeer::new(ice, events).await?;
        Ok(Arc::new(peer))
    }
}

struct LocalSender {
    sender: Arc<RTCRtpSender>,
    rtp_track: Arc<TrackLocalStaticSample>,
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, LocalSender>>,
    remote_tracks: Arc<Mutex<HashMap<String, Arc<TrackRemote>>>>,
}

impl RtcPeer {
    pub async fn new(ice: &IceConfig, events: PeerEvents) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(ice.rtc_configuration()).await?);
        let remote_tracks = Arc::new(Mutex::new(HashMap::new()));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => PeerState::New,
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                    _ => return,
                };
                let _ = events.send(PeerEvent::StateChanged(state));
            })
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let track_events = events;
        let tracks = Arc::clone(&remote_tracks);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let tracks = Arc::clone(&tracks);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    let id = format!("{}:{}", track.stream_id(), track.id());
                    tracing::info!("Remote {} track {}", kind.as_str(), id);
                    tracks.lock().insert(id.clone(), Arc::clone(&track));
                    let _ = events.send(PeerEvent::RemoteTrack(MediaTrack::remote(id, kind)));
                })
            },
        ));

        Ok(Self {
            pc,
            senders: Mutex::new(HashMap::new()),
            remote_tracks,
        })
    }

    /// RTP track the host writes captured samples into for a local track.
    pub fn local_rtp_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .get(track_id)
            .map(|s| Arc::clone(&s.rtp_track))
    }

    /// Native remote track for rendering.
    pub fn remote_track(&self, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks.lock().get(track_id).cloned()
    }

    fn rtp_track_for(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let capability = match track.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_owned(),
            "wavecall".to_owned(),
        ))
    }

    fn has_sender(&self, kind: MediaKind) -> bool {
        let wanted = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        self.senders
            .lock()
            .values()
            .any(|s| s.rtp_track.codec().mime_type == wanted)
    }

    async fn ensure_receiver(&self, kind: MediaKind) -> Result<()> {
        if self.has_sender(kind) {
            return Ok(());
        }
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        self.pc.add_transceiver_from_kind(codec_type, Some(init)).await?;
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc("No local description".to_string()))?;
        Ok(SessionDescription {
            sdp_type: sdp_type_from_rtc(desc.sdp_type),
            sdp: desc.sdp,
        })
    }
}

fn sdp_type_from_rtc(t: webrtc::peer_connection::sdp::sdp_type::RTCSdpType) -> SdpType {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    match t {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Offer,
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let rtp_track = Self::rtp_track_for(track);
        let sender = self
            .pc
            .add_track(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so the interceptors keep running.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders
            .lock()
            .insert(track.id().to_owned(), LocalSender { sender, rtp_track });
        Ok(())
    }

    async fn replace_track(&self, old_track_id: &str, track: &MediaTrack) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .remove(old_track_id)
            .map(|s| s.sender)
            .ok_or_else(|| Error::WebRtc(format!("No sender for track {}", old_track_id)))?;

        let rtp_track = Self::rtp_track_for(track);
        sender
            .replace_track(Some(Arc::clone(&rtp_track) as Arc<dyn TrackLocal + Send + Sync>))
            .await?;

        self.senders
            .lock()
            .insert(track.id().to_owned(), LocalSender { sender, rtp_track });
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription> {
        if options.receive_audio {
            self.ensure_receiver(MediaKind::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiver(MediaKind::Video).await?;
        }

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let sdp = description.sdp.clone();
        let desc = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(sdp)?,
            SdpType::Pranswer => RTCSessionDescription::pranswer(sdp)?,
            SdpType::Rollback => {
                return Err(Error::Unsupported("rollback descriptions".to_string()))
            }
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.remote_tracks.lock().clear();
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PeerState::Disconnected.is_terminal());
        assert!(PeerState::Failed.is_terminal());
        assert!(PeerState::Closed.is_terminal());
        assert!(!PeerState::Connecting.is_terminal());
        assert!(!PeerState::Connected.is_terminal());
    }

    #[tokio::test]
    async fn test_offer_has_requested_sections() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RtcPeer::new(&IceConfig::stun_only(), tx).await.unwrap();

        let mic = MediaTrack::new("mic", MediaKind::Audio, "microphone", crate::media::TrackSource::Microphone);
        peer.add_track(&mic).await.unwrap();
        assert!(peer.local_rtp_track("mic").is_some());

        let offer = peer
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: true,
            })
            .await
            .unwrap();

        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        peer.close().await.unwrap();
    }
}
