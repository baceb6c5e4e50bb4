//! Dispatch of inbound signaling to participant connections.
//!
//! The engine owns nothing per connection. It decides which connection a
//! message belongs to, creates connections on `user-joined` and on offers
//! from unknown participants, and enqueues the message on that connection's
//! task.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::connection::{self, ConnectionContext, PeerCommand, TeardownRequest};
use crate::directory::{ParticipantConnection, SessionDirectory};
use crate::errors::{HuddleError, PeerError};
use crate::events::MeetingEvent;
use crate::peer::{NegotiationRole, PeerConnectionFactory, SessionDescription};
use crate::signaling::{self, SignalingMessage};
use crate::tracks::{self, TrackRouter};

#[derive(Clone)]
pub(crate) struct NegotiationEngine {
    ctx: ConnectionContext,
    factory: Arc<dyn PeerConnectionFactory>,
    directory: Arc<Mutex<SessionDirectory>>,
    router: Arc<Mutex<TrackRouter>>,
}

impl NegotiationEngine {
    pub fn new(
        ctx: ConnectionContext,
        factory: Arc<dyn PeerConnectionFactory>,
        directory: Arc<Mutex<SessionDirectory>>,
        router: Arc<Mutex<TrackRouter>>,
    ) -> Self {
        Self {
            ctx,
            factory,
            directory,
            router,
        }
    }

    /// Decode and dispatch one inbound frame.
    pub async fn handle_text(&self, text: &str) -> Result<(), HuddleError> {
        let message = signaling::decode(text)?;
        self.handle_message(message).await
    }

    pub async fn handle_message(&self, message: SignalingMessage) -> Result<(), HuddleError> {
        let self_id = self.ctx.self_id.as_str();
        if message.sender() == Some(self_id) {
            tracing::debug!(kind = message.kind(), "ignoring own message echoed by relay");
            return Ok(());
        }
        if let Some(to) = message.recipient().filter(|to| *to != self_id) {
            tracing::debug!(kind = message.kind(), to, "ignoring message for another participant");
            return Ok(());
        }
        tracing::debug!(kind = message.kind(), from = ?message.sender(), "signaling message");

        match message {
            SignalingMessage::UserJoined { user_id, user_name } => {
                if user_id == self_id {
                    return Ok(());
                }
                self.on_user_joined(user_id, user_name).await
            }
            SignalingMessage::UserLeft { user_id } => {
                self.on_user_left(user_id).await;
                Ok(())
            }
            SignalingMessage::Offer { from, sdp, .. } => self.on_offer(from, sdp).await,
            SignalingMessage::Answer { from, sdp, .. } => {
                self.route(&from, PeerCommand::RemoteAnswer(sdp)).await
            }
            SignalingMessage::IceCandidate {
                from, candidate, ..
            } => {
                self.route(&from, PeerCommand::RemoteCandidate(candidate))
                    .await
            }
            SignalingMessage::MediaStateChange { .. }
            | SignalingMessage::ScreenShareStarted { .. }
            | SignalingMessage::ScreenShareStopped { .. } => {
                tracks::forward_media_state(&self.ctx.emitter, &message);
                Ok(())
            }
            // Relay bookkeeping; it announces membership as user-joined/user-left.
            SignalingMessage::Join { .. } | SignalingMessage::Leave { .. } => Ok(()),
        }
    }

    async fn on_user_joined(
        &self,
        participant_id: String,
        name: Option<String>,
    ) -> Result<(), HuddleError> {
        tracing::info!(participant = %participant_id, "participant joined");
        self.ctx.emitter.emit(MeetingEvent::ParticipantJoined {
            participant_id: participant_id.clone(),
            name,
        });

        let mut directory = self.directory.lock().await;
        if directory.remove(&participant_id).is_some() {
            tracing::info!(participant = %participant_id, "replacing stale connection");
        }
        let (connection, _) = directory
            .get_or_create(&participant_id, || {
                self.open_connection(&participant_id, NegotiationRole::Offerer)
            })
            .await
            .map_err(|e| self.creation_failed(&participant_id, e))?;
        connection.enqueue(PeerCommand::Negotiate);
        Ok(())
    }

    async fn on_user_left(&self, participant_id: String) {
        tracing::info!(participant = %participant_id, "participant left");
        self.directory.lock().await.remove(&participant_id);
        self.ctx
            .emitter
            .emit(MeetingEvent::ParticipantLeft(participant_id));
    }

    async fn on_offer(&self, from: String, sdp: SessionDescription) -> Result<(), HuddleError> {
        let mut directory = self.directory.lock().await;
        let (connection, created) = directory
            .get_or_create(&from, || {
                self.open_connection(&from, NegotiationRole::Answerer)
            })
            .await
            .map_err(|e| self.creation_failed(&from, e))?;
        connection.enqueue(PeerCommand::RemoteOffer(sdp));
        if created {
            tracing::info!(participant = %from, "offer from new participant");
            self.ctx.emitter.emit(MeetingEvent::ParticipantJoined {
                participant_id: from,
                name: None,
            });
        }
        Ok(())
    }

    async fn route(&self, from: &str, command: PeerCommand) -> Result<(), HuddleError> {
        let directory = self.directory.lock().await;
        match directory.get(from) {
            Some(connection) => {
                connection.enqueue(command);
                Ok(())
            }
            None => Err(HuddleError::UnknownRecipient(from.to_string())),
        }
    }

    /// Build a connection bound to every current local track. Called with
    /// the directory locked, so the track set cannot change meanwhile.
    async fn open_connection(
        &self,
        participant_id: &str,
        role: NegotiationRole,
    ) -> Result<ParticipantConnection, PeerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self.factory.create(participant_id, events_tx).await?;
        let tracks = self.router.lock().await.bindings();
        tracing::debug!(
            participant = participant_id,
            ?role,
            tracks = tracks.len(),
            "opening participant connection"
        );
        Ok(connection::spawn(
            self.ctx.clone(),
            participant_id.to_string(),
            role,
            peer,
            events_rx,
            tracks,
        ))
    }

    fn creation_failed(&self, participant_id: &str, error: PeerError) -> HuddleError {
        tracing::error!(participant = participant_id, %error, "cannot create peer connection");
        let reason = error.to_string();
        self.ctx.emitter.emit(MeetingEvent::NegotiationFailed {
            participant_id: participant_id.to_string(),
            reason: reason.clone(),
        });
        HuddleError::Negotiation {
            participant_id: participant_id.to_string(),
            reason,
        }
    }

    /// Remove a connection whose task hit a fatal error. Requests from a
    /// connection that was already replaced are ignored.
    pub async fn handle_teardown(&self, request: TeardownRequest) {
        let removed = self
            .directory
            .lock()
            .await
            .remove_connection(&request.participant_id, request.connection_id);
        if removed.is_none() {
            tracing::debug!(participant = %request.participant_id, "stale teardown request");
            return;
        }
        if !matches!(request.error, PeerError::ConnectionLost(_)) {
            self.ctx.emitter.emit(MeetingEvent::NegotiationFailed {
                participant_id: request.participant_id,
                reason: request.error.to_string(),
            });
        }
    }
}
