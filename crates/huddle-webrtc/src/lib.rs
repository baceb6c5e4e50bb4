//! webrtc-rs backed peer connections for the huddle core.
//!
//! One [`WebRtcPeerFactory`] holds a configured webrtc-rs API (default
//! codecs, default interceptors) and opens one `RTCPeerConnection` per
//! remote participant.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::peer::{
    IceConnectionState, PeerConnectionState, RemoteTrack, SdpType, TrackKind,
};
use huddle_core::{
    IceCandidate, IceServer, LocalTrackBinding, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, SessionDescription,
};
use thiserror::Error;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("track '{0}' was not created by this backend")]
    ForeignTrack(String),
    #[error("unsupported session description type {0}")]
    UnsupportedSdpType(RTCSdpType),
    #[error("track '{track}' belongs to stream '{actual}', not '{requested}'")]
    StreamMismatch {
        track: String,
        requested: String,
        actual: String,
    },
}

impl From<BackendError> for PeerError {
    fn from(e: BackendError) -> Self {
        PeerError::Platform(e.to_string())
    }
}

/// Local media as the backend needs it. Wrap a webrtc-rs track in this to
/// publish it through [`MediaTrack::media`].
pub struct LocalMedia {
    pub track: Arc<dyn TrackLocal + Send + Sync>,
}

/// A sample-fed local track ready to attach. Write encoded frames into
/// the returned `TrackLocalStaticSample`.
pub fn local_sample_track(
    kind: TrackKind,
    id: &str,
    stream_id: &str,
) -> (MediaTrack, Arc<TrackLocalStaticSample>) {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    let sample = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        stream_id.to_owned(),
    ));
    let media = Arc::new(LocalMedia {
        track: sample.clone(),
    });
    (MediaTrack::new(id, kind, media), sample)
}

pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self, BackendError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        participant_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(BackendError::from)?,
        );
        install_handlers(&pc, participant_id, events);
        tracing::debug!(participant = participant_id, "rtc peer connection created");

        Ok(Arc::new(WebRtcPeer {
            participant_id: participant_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// Forward webrtc-rs callbacks into the core's per-connection event stream.
fn install_handlers(pc: &RTCPeerConnection, participant_id: &str, events: PeerEventSender) {
    let tx = events.clone();
    let participant = participant_id.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let participant = participant.clone();
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                }
                Err(e) => tracing::warn!(%participant, "cannot serialize local candidate: {e}"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(PeerEvent::ConnectionStateChanged(from_rtc_connection_state(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = tx.send(PeerEvent::IceStateChanged(from_rtc_ice_state(state)));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = tx.send(PeerEvent::TrackAdded(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
                media: track,
            }));
            Box::pin(async {})
        },
    ));
}

pub struct WebRtcPeer {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, binding: &LocalTrackBinding) -> Result<(), PeerError> {
        let media = binding
            .track
            .media
            .downcast_ref::<LocalMedia>()
            .ok_or_else(|| BackendError::ForeignTrack(binding.track_id().to_string()))?;
        // webrtc-rs fixes the stream id when the track is built.
        if media.track.stream_id() != binding.stream_id {
            return Err(BackendError::StreamMismatch {
                track: binding.track_id().to_string(),
                requested: binding.stream_id.clone(),
                actual: media.track.stream_id().to_string(),
            }
            .into());
        }
        let sender = self
            .pc
            .add_track(media.track.clone())
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        // RTCP has to be drained for the interceptors to run.
        let rtcp = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders
            .lock()
            .await
            .insert(binding.track_id().to_string(), sender);
        tracing::debug!(participant = %self.participant_id, track = binding.track_id(), "track added");
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .await
            .remove(track_id)
            .ok_or_else(|| PeerError::Track(format!("track '{track_id}' is not bound")))?;
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        Ok(from_rtc_description(offer)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        Ok(from_rtc_description(answer)?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().await.clear();
        self.pc.close().await.map_err(|e| PeerError::Platform(e.to_string()))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp;
    let converted = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    converted.map_err(|e| PeerError::Description(e.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, BackendError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(BackendError::UnsupportedSdpType(other)),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            PeerConnectionState::New
        }
    }
}

fn from_rtc_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::New | RTCIceConnectionState::Unspecified => {
            IceConnectionState::New
        }
    }
}
