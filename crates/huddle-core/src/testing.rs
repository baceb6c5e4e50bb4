//! Fakes shared by the unit tests: a scripted peer connection, an in-memory
//! relay and an event recorder.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::connection::ConnectionStatus;
use crate::errors::{PeerError, TransportError};
use crate::events::{MeetingEvent, MeetingEventListener};
use crate::peer::{
    IceCandidate, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender,
    SdpType, SessionDescription, TrackKind,
};
use crate::signaling::{self, SignalingMessage};
use crate::tracks::LocalTrackBinding;
use crate::transport::{SignalingChannel, SignalingConnector, SignalingSender, TransportEvent};

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack(String),
    RemoveTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Peer connection double. Descriptions or candidates containing
/// `malformed` and track ids containing `rejected` fail like a platform
/// rejection would. Generated offers list the bound track ids.
pub struct FakePeer {
    participant_id: String,
    events: PeerEventSender,
    calls: Mutex<Vec<PeerCall>>,
    tracks: Mutex<Vec<String>>,
    closed: watch::Sender<bool>,
    close_delay: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
}

impl FakePeer {
    pub fn new(participant_id: &str, events: PeerEventSender) -> Self {
        let (gate, _) = watch::channel(true);
        let (closed, _) = watch::channel(false);
        Self {
            participant_id: participant_id.to_string(),
            events,
            calls: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            closed,
            close_delay: Mutex::new(None),
            gate,
        }
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        tokio::time::timeout(TIMEOUT, closed.wait_for(|closed| *closed))
            .await
            .expect("timed out waiting for the peer to close")
            .expect("close flag dropped");
    }

    /// Make `close` take `delay` before it completes.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = Some(delay);
    }

    /// Raise a platform callback.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    /// Hold every description and candidate operation until [`resume`].
    ///
    /// [`resume`]: FakePeer::resume
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    async fn pass_gate(&self) {
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        if description.sdp.contains("malformed") {
            return Err(PeerError::Description(format!(
                "cannot parse sdp from {}",
                self.participant_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, binding: &LocalTrackBinding) -> Result<(), PeerError> {
        self.record(PeerCall::AddTrack(binding.track_id().to_string()));
        if binding.track_id().contains("rejected") {
            return Err(PeerError::Track(binding.track_id().to_string()));
        }
        self.tracks.lock().unwrap().push(binding.track_id().to_string());
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        self.record(PeerCall::RemoveTrack(track_id.to_string()));
        self.tracks.lock().unwrap().retain(|t| t != track_id);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.pass_gate().await;
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "offer tracks={}",
            self.tracks().join(",")
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.pass_gate().await;
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "answer tracks={}",
            self.tracks().join(",")
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pass_gate().await;
        self.record(PeerCall::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pass_gate().await;
        self.record(PeerCall::SetRemote(description.sdp_type));
        self.check_description(&description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pass_gate().await;
        if candidate.candidate.contains("malformed") {
            return Err(PeerError::Candidate(candidate.candidate));
        }
        self.record(PeerCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Close);
        let delay = *self.close_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and remembers them per participant.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<HashMap<String, Vec<Arc<FakePeer>>>>,
    refused: Mutex<Vec<String>>,
}

impl FakePeerFactory {
    /// Latest peer created for `participant_id`.
    pub fn peer(&self, participant_id: &str) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .get(participant_id)
            .and_then(|peers| peers.last().cloned())
            .unwrap_or_else(|| panic!("no peer created for {participant_id}"))
    }

    /// Every peer created for `participant_id`, oldest first.
    pub fn peers(&self, participant_id: &str) -> Vec<Arc<FakePeer>> {
        self.peers
            .lock()
            .unwrap()
            .get(participant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self, participant_id: &str) -> usize {
        self.peers
            .lock()
            .unwrap()
            .get(participant_id)
            .map_or(0, Vec::len)
    }

    /// Make creation fail for `participant_id`.
    pub fn refuse(&self, participant_id: &str) {
        self.refused.lock().unwrap().push(participant_id.to_string());
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        participant_id: &str,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.refused.lock().unwrap().iter().any(|id| id == participant_id) {
            return Err(PeerError::Platform("no media stack".into()));
        }
        let peer = Arc::new(FakePeer::new(participant_id, events));
        self.peers
            .lock()
            .unwrap()
            .entry(participant_id.to_string())
            .or_default()
            .push(peer.clone());
        Ok(peer)
    }
}

/// Connector handing out one pre-built in-memory channel.
pub struct MemoryConnector {
    channel: Mutex<Option<SignalingChannel>>,
    endpoint: Mutex<Option<Url>>,
}

impl MemoryConnector {
    /// A connector that always fails, like an unreachable relay.
    pub fn unreachable() -> Self {
        Self {
            channel: Mutex::new(None),
            endpoint: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingChannel, TransportError> {
        *self.endpoint.lock().unwrap() = Some(endpoint.clone());
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Connect("connection refused".into()))
    }
}

/// The relay side of a [`MemoryConnector`].
pub struct MemoryRelay {
    inbound: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryRelay {
    pub fn new() -> (MemoryConnector, MemoryRelay) {
        let (out_tx, outbound) = mpsc::unbounded_channel();
        let (inbound, events) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            channel: Mutex::new(Some(SignalingChannel {
                sender: SignalingSender::new(out_tx),
                events,
            })),
            endpoint: Mutex::new(None),
        };
        (connector, MemoryRelay { inbound, outbound })
    }

    pub fn deliver(&self, message: Value) {
        self.deliver_raw(&message.to_string());
    }

    pub fn deliver_raw(&self, text: &str) {
        let _ = self.inbound.send(TransportEvent::Message(text.to_string()));
    }

    /// Drop the connection the way a relay going away would.
    pub fn close(&mut self) {
        self.outbound.close();
        let _ = self.inbound.send(TransportEvent::Closed);
    }

    pub async fn next_sent(&mut self) -> SignalingMessage {
        recv_message(&mut self.outbound).await
    }

    /// Everything sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        let mut sent = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            sent.push(signaling::decode(&text).unwrap());
        }
        sent
    }
}

/// Listener recording every event.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<MeetingEvent>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<MeetingEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MeetingEventListener for EventLog {
    fn on_event(&self, event: MeetingEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn video_track(id: &str) -> MediaTrack {
    MediaTrack::new(id, TrackKind::Video, Arc::new(()))
}

pub fn audio_track(id: &str) -> MediaTrack {
    MediaTrack::new(id, TrackKind::Audio, Arc::new(()))
}

pub async fn recv_message(rx: &mut mpsc::UnboundedReceiver<String>) -> SignalingMessage {
    let text = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("signaling channel closed");
    signaling::decode(&text).unwrap()
}

pub async fn wait_for_status(
    mut status: watch::Receiver<ConnectionStatus>,
    predicate: impl FnMut(&ConnectionStatus) -> bool,
) {
    tokio::time::timeout(TIMEOUT, status.wait_for(predicate))
        .await
        .expect("timed out waiting for connection status")
        .expect("connection status dropped");
}
