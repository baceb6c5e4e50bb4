//! Per-participant negotiation task.
//!
//! Every offer, answer, candidate, track change and platform callback for one
//! participant goes through a single ordered queue drained by one task, so no
//! two steps of the same state machine ever interleave. Connections to
//! different participants progress independently.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::directory::ParticipantConnection;
use crate::errors::PeerError;
use crate::events::{EventEmitter, MeetingEvent};
use crate::peer::{
    IceCandidate, IceConnectionState, NegotiationRole, PeerConnection, PeerConnectionState,
    PeerEvent, SessionDescription, SignalingState,
};
use crate::signaling::SignalingMessage;
use crate::tracks::{self, LocalTrackBinding};
use crate::transport::SignalingSender;

/// Work items for one connection, applied in order.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// Send an offer now if stable, otherwise once stable again.
    Negotiate,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    AttachTrack(LocalTrackBinding),
    DetachTrack(String),
}

/// Snapshot of one participant connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Role taken in the latest negotiation round.
    pub role: NegotiationRole,
    pub signaling: SignalingState,
    pub connection: PeerConnectionState,
    pub ice: IceConnectionState,
    /// Local track ids bound on this connection.
    pub local_tracks: BTreeSet<String>,
}

impl ConnectionStatus {
    pub fn new(role: NegotiationRole) -> Self {
        Self {
            role,
            signaling: SignalingState::New,
            connection: PeerConnectionState::New,
            ice: IceConnectionState::New,
            local_tracks: BTreeSet::new(),
        }
    }
}

/// Shared by every connection task of a session.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub self_id: String,
    pub signaling: SignalingSender,
    pub emitter: EventEmitter,
    pub teardown: mpsc::UnboundedSender<TeardownRequest>,
}

/// Sent by a connection task that hit a fatal error. The session removes
/// the connection if it is still the current one for that participant.
#[derive(Debug)]
pub(crate) struct TeardownRequest {
    pub participant_id: String,
    pub connection_id: Uuid,
    pub error: PeerError,
}

/// Start the task for a new connection. `tracks` are bound before any
/// queued command runs.
pub(crate) fn spawn(
    ctx: ConnectionContext,
    participant_id: String,
    role: NegotiationRole,
    peer: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    tracks: Vec<LocalTrackBinding>,
) -> ParticipantConnection {
    let connection_id = Uuid::new_v4();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status, _) = watch::channel(ConnectionStatus::new(role));
    let status = Arc::new(status);

    let span = tracing::info_span!("connection", participant = %participant_id, ?role);
    let negotiator = Negotiator {
        ctx,
        participant_id: participant_id.clone(),
        connection_id,
        peer: peer.clone(),
        status: status.clone(),
        bound: BTreeSet::new(),
        pending_candidates: VecDeque::new(),
        has_remote_description: false,
        renegotiation_pending: false,
    };
    let task = tokio::spawn(negotiator.run(commands_rx, events, tracks).instrument(span));

    ParticipantConnection::new(participant_id, connection_id, peer, commands_tx, status, task)
}

struct Negotiator {
    ctx: ConnectionContext,
    participant_id: String,
    connection_id: Uuid,
    peer: Arc<dyn PeerConnection>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    bound: BTreeSet<String>,
    /// Remote candidates that arrived before any remote description.
    pending_candidates: VecDeque<IceCandidate>,
    has_remote_description: bool,
    renegotiation_pending: bool,
}

impl Negotiator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        tracks: Vec<LocalTrackBinding>,
    ) {
        if let Err(error) = self.attach_initial(tracks).await {
            self.halt(error);
            return;
        }

        loop {
            let step = tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = events.recv() => self.handle_peer_event(event),
                else => break,
            };
            if let Err(error) = step {
                self.halt(error);
                break;
            }
        }
        tracing::debug!("connection task ended");
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::Negotiate => self.negotiate().await,
            PeerCommand::RemoteOffer(offer) => self.on_remote_offer(offer).await,
            PeerCommand::RemoteAnswer(answer) => self.on_remote_answer(answer).await,
            PeerCommand::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
            PeerCommand::AttachTrack(binding) => self.attach(binding).await,
            PeerCommand::DetachTrack(track_id) => self.detach(&track_id).await,
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) -> Result<(), PeerError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send(SignalingMessage::ice_candidate(
                    &self.ctx.self_id,
                    &self.participant_id,
                    candidate,
                ));
                Ok(())
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::info!(?state, "peer connection state changed");
                self.publish(|s| s.connection = state);
                self.ctx
                    .emitter
                    .emit(MeetingEvent::ParticipantConnectionStateChanged {
                        participant_id: self.participant_id.clone(),
                        state,
                    });
                match state {
                    PeerConnectionState::Failed | PeerConnectionState::Closed => {
                        Err(PeerError::ConnectionLost(state))
                    }
                    _ => Ok(()),
                }
            }
            PeerEvent::IceStateChanged(state) => {
                tracing::debug!(?state, "ice connection state changed");
                self.publish(|s| s.ice = state);
                Ok(())
            }
            PeerEvent::TrackAdded(track) => {
                tracks::surface_remote_track(&self.ctx.emitter, &self.participant_id, track);
                Ok(())
            }
        }
    }

    async fn attach_initial(&mut self, tracks: Vec<LocalTrackBinding>) -> Result<(), PeerError> {
        for binding in tracks {
            self.peer.add_track(&binding).await?;
            self.ensure_live()?;
            self.bound.insert(binding.track_id().to_string());
        }
        self.publish_tracks();
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<(), PeerError> {
        let state = self.signaling_state();
        if !matches!(state, SignalingState::New | SignalingState::Stable) {
            tracing::debug!(?state, "negotiation in progress, renegotiation queued");
            self.renegotiation_pending = true;
            return Ok(());
        }
        if !self.ctx.signaling.is_open() {
            tracing::warn!("signaling unavailable, renegotiation deferred");
            self.renegotiation_pending = true;
            return Ok(());
        }
        self.renegotiation_pending = false;

        let offer = self.peer.create_offer().await?;
        self.ensure_live()?;
        self.peer.set_local_description(offer.clone()).await?;
        self.ensure_live()?;
        self.publish(|s| {
            s.signaling = SignalingState::HaveLocalOffer;
            s.role = NegotiationRole::Offerer;
        });

        tracing::info!("sending offer");
        self.send(SignalingMessage::offer(
            &self.ctx.self_id,
            &self.participant_id,
            offer,
        ));
        Ok(())
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        if self.signaling_state() == SignalingState::HaveLocalOffer {
            // Glare. The smaller id yields: it rolls back and answers, then
            // re-offers its own pending change.
            if !self.is_polite() {
                tracing::warn!("offer collision, keeping local offer");
                return Ok(());
            }
            tracing::info!("offer collision, rolling back local offer");
            self.peer
                .set_local_description(SessionDescription::rollback())
                .await?;
            self.ensure_live()?;
            self.renegotiation_pending = true;
            self.publish(|s| s.signaling = SignalingState::Stable);
        }

        self.peer.set_remote_description(offer).await?;
        self.ensure_live()?;
        self.has_remote_description = true;
        self.publish(|s| {
            s.signaling = SignalingState::HaveRemoteOffer;
            s.role = NegotiationRole::Answerer;
        });
        self.flush_candidates().await?;

        let answer = self.peer.create_answer().await?;
        self.ensure_live()?;
        self.peer.set_local_description(answer.clone()).await?;
        self.ensure_live()?;
        self.publish(|s| s.signaling = SignalingState::Stable);

        tracing::info!("sending answer");
        self.send(SignalingMessage::answer(
            &self.ctx.self_id,
            &self.participant_id,
            answer,
        ));
        self.on_stable().await
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        let state = self.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!(?state, "discarding answer without a pending local offer");
            return Ok(());
        }

        self.peer.set_remote_description(answer).await?;
        self.ensure_live()?;
        self.has_remote_description = true;
        self.flush_candidates().await?;
        self.publish(|s| s.signaling = SignalingState::Stable);
        tracing::info!("negotiation complete");
        self.on_stable().await
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.has_remote_description {
            self.pending_candidates.push_back(candidate);
            tracing::debug!(
                queued = self.pending_candidates.len(),
                "remote candidate queued until remote description"
            );
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await?;
        self.ensure_live()
    }

    async fn flush_candidates(&mut self) -> Result<(), PeerError> {
        if !self.pending_candidates.is_empty() {
            tracing::debug!(
                count = self.pending_candidates.len(),
                "applying queued remote candidates"
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.peer.add_ice_candidate(candidate).await?;
            self.ensure_live()?;
        }
        Ok(())
    }

    async fn on_stable(&mut self) -> Result<(), PeerError> {
        if self.renegotiation_pending {
            tracing::debug!("running queued renegotiation");
            self.negotiate().await
        } else {
            Ok(())
        }
    }

    async fn attach(&mut self, binding: LocalTrackBinding) -> Result<(), PeerError> {
        if self.bound.contains(binding.track_id()) {
            return Ok(());
        }
        self.peer.add_track(&binding).await?;
        self.ensure_live()?;
        self.bound.insert(binding.track_id().to_string());
        self.publish_tracks();
        self.negotiate().await
    }

    async fn detach(&mut self, track_id: &str) -> Result<(), PeerError> {
        if !self.bound.contains(track_id) {
            return Ok(());
        }
        self.peer.remove_track(track_id).await?;
        self.ensure_live()?;
        self.bound.remove(track_id);
        self.publish_tracks();
        self.negotiate().await
    }

    fn halt(&self, error: PeerError) {
        if matches!(error, PeerError::Closed) || self.is_closed() {
            tracing::debug!("connection closed, stopping");
            return;
        }
        tracing::error!(%error, "participant connection failed");
        self.publish(|s| s.signaling = SignalingState::Closed);
        let _ = self.ctx.teardown.send(TeardownRequest {
            participant_id: self.participant_id.clone(),
            connection_id: self.connection_id,
            error,
        });
    }

    fn send(&self, message: SignalingMessage) {
        if let Err(e) = self.ctx.signaling.send(&message) {
            tracing::warn!(kind = message.kind(), "signaling send failed: {e}");
        }
    }

    /// The lexicographically smaller id is the polite side of a collision.
    fn is_polite(&self) -> bool {
        self.ctx.self_id < self.participant_id
    }

    fn signaling_state(&self) -> SignalingState {
        self.status.borrow().signaling
    }

    fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    /// Checked after every await: a connection closed meanwhile must not
    /// be written to.
    fn ensure_live(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Apply `f` to the published status. Closed is terminal.
    fn publish(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_if_modified(|status| {
            if status.signaling == SignalingState::Closed {
                return false;
            }
            f(status);
            true
        });
    }

    fn publish_tracks(&self) {
        let tracks = self.bound.clone();
        self.publish(|s| s.local_tracks = tracks);
    }
}
