use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;

use crate::connection::{ConnectionContext, ConnectionStatus, TeardownRequest};
use crate::directory::SessionDirectory;
use crate::errors::HuddleError;
use crate::events::{EventEmitter, MeetingEvent, MeetingEventListener, SessionState};
use crate::link;
use crate::negotiation::NegotiationEngine;
use crate::peer::{MediaTrack, PeerConnectionFactory, TrackSource};
use crate::signaling::SignalingMessage;
use crate::tracks::{LocalTrackBinding, TrackRouter};
use crate::transport::{SignalingConnector, SignalingSender, TransportEvent};

struct ActiveSession {
    self_id: String,
    signaling: SignalingSender,
    dispatcher: JoinHandle<()>,
}

/// One meeting membership: the signaling channel plus every participant
/// connection of the mesh.
///
/// Independent instances share nothing, so several meetings can run side by
/// side in one process.
pub struct MeetingSession {
    signaling_url: Url,
    connector: Arc<dyn SignalingConnector>,
    factory: Arc<dyn PeerConnectionFactory>,
    emitter: EventEmitter,
    directory: Arc<Mutex<SessionDirectory>>,
    router: Arc<Mutex<TrackRouter>>,
    state: Arc<Mutex<SessionState>>,
    active: Mutex<Option<ActiveSession>>,
}

impl MeetingSession {
    pub fn new(
        signaling_url: Url,
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        Self {
            signaling_url,
            connector,
            factory,
            emitter: EventEmitter::new(),
            directory: Arc::new(Mutex::new(SessionDirectory::new())),
            router: Arc::new(Mutex::new(TrackRouter::new())),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            active: Mutex::new(None),
        }
    }

    /// Register a listener for meeting events.
    pub fn add_listener(&self, listener: Arc<dyn MeetingEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub async fn session_state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Ids of the participants with a live connection, sorted.
    pub async fn participants(&self) -> Vec<String> {
        self.directory.lock().await.ids()
    }

    pub async fn connection_status(&self, participant_id: &str) -> Option<ConnectionStatus> {
        self.directory
            .lock()
            .await
            .get(participant_id)
            .map(|c| c.status())
    }

    /// Follow status changes of one connection. The receiver sees
    /// `Closed` when the connection goes away.
    pub async fn watch_connection(
        &self,
        participant_id: &str,
    ) -> Option<watch::Receiver<ConnectionStatus>> {
        self.directory
            .lock()
            .await
            .get(participant_id)
            .map(|c| c.watch())
    }

    /// Join `meeting_id`: open signaling, announce ourselves and start
    /// dispatching. `local_tracks` are bound on every connection created
    /// from now on.
    ///
    /// A concurrent [`stop`](Self::stop) waits for this to finish.
    pub async fn start(
        &self,
        meeting_id: &str,
        self_id: &str,
        self_name: &str,
        local_tracks: Vec<LocalTrackBinding>,
    ) -> Result<(), HuddleError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(HuddleError::AlreadyStarted);
        }

        let endpoint = link::endpoint_for(&self.signaling_url, meeting_id)?;
        self.set_state(SessionState::Connecting).await;
        tracing::info!(meeting = meeting_id, url = %endpoint, "joining meeting");

        let channel = match self.connector.connect(&endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("signaling connect failed: {e}");
                self.set_state(SessionState::Idle).await;
                return Err(e.into());
            }
        };

        if let Err(e) = channel.sender.send(&SignalingMessage::join(self_id, self_name)) {
            tracing::warn!("join not sent: {e}");
            self.set_state(SessionState::Idle).await;
            return Err(e.into());
        }

        // Nothing below fails, and the dispatcher is not running yet, so
        // every connection sees the full track set.
        {
            let directory = self.directory.lock().await;
            let mut router = self.router.lock().await;
            for binding in local_tracks {
                router.attach(binding, &directory);
            }
        }

        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(
            ConnectionContext {
                self_id: self_id.to_string(),
                signaling: channel.sender.clone(),
                emitter: self.emitter.clone(),
                teardown: teardown_tx,
            },
            self.factory.clone(),
            self.directory.clone(),
            self.router.clone(),
        );

        self.set_state(SessionState::Joined).await;

        let span = tracing::info_span!("meeting", meeting = meeting_id, self_id);
        let dispatcher = tokio::spawn(
            Self::event_loop(
                engine,
                channel.events,
                teardown_rx,
                self.emitter.clone(),
                self.state.clone(),
            )
            .instrument(span),
        );

        *active = Some(ActiveSession {
            self_id: self_id.to_string(),
            signaling: channel.sender,
            dispatcher,
        });
        Ok(())
    }

    /// Leave the meeting. Safe to call any number of times, before or after
    /// [`start`](Self::start).
    pub async fn stop(&self) {
        let active = self.active.lock().await.take();
        let Some(active) = active else {
            tracing::debug!("stop: no active meeting");
            let closing = self.directory.lock().await.clear();
            join_all(closing).await;
            return;
        };

        // Waiting for the directory lets an in-flight dispatch finish first,
        // so no half-built connection is dropped unclosed.
        let mut directory = self.directory.lock().await;
        active.dispatcher.abort();

        if let Err(e) = active.signaling.send(&SignalingMessage::leave(&active.self_id)) {
            tracing::debug!("leave not sent: {e}");
        }
        let count = directory.len();
        let closing = directory.clear();
        drop(directory);
        self.router.lock().await.clear();
        join_all(closing).await;

        tracing::info!(connections = count, "left meeting");
        self.set_state(SessionState::Stopped).await;
    }

    /// Publish a local track to every participant. Screen tracks are also
    /// announced with `screen-share-started`.
    ///
    /// Returns `false` if a track with this id is already attached.
    pub async fn attach_local_track(
        &self,
        track: MediaTrack,
        stream_id: &str,
        source: TrackSource,
    ) -> bool {
        let attached = {
            let directory = self.directory.lock().await;
            let mut router = self.router.lock().await;
            router.attach(LocalTrackBinding::new(track, stream_id, source), &directory)
        };
        if attached && source == TrackSource::Screen {
            if let Err(e) = self
                .broadcast(|self_id| SignalingMessage::screen_share(self_id, true))
                .await
            {
                tracing::debug!("screen share not announced: {e}");
            }
        }
        attached
    }

    /// Stop publishing a local track. The last screen track going away is
    /// announced with `screen-share-stopped`.
    pub async fn detach_local_track(&self, track_id: &str) -> Option<LocalTrackBinding> {
        let (binding, still_sharing) = {
            let directory = self.directory.lock().await;
            let mut router = self.router.lock().await;
            let binding = router.detach(track_id, &directory)?;
            (binding, router.is_screen_sharing())
        };
        if binding.source == TrackSource::Screen && !still_sharing {
            if let Err(e) = self
                .broadcast(|self_id| SignalingMessage::screen_share(self_id, false))
                .await
            {
                tracing::debug!("screen share stop not announced: {e}");
            }
        }
        Some(binding)
    }

    /// Broadcast our mute/camera state. Purely informational for the other
    /// participants.
    pub async fn notify_media_state(
        &self,
        is_muted: bool,
        is_video_off: bool,
    ) -> Result<(), HuddleError> {
        self.broadcast(|self_id| SignalingMessage::media_state(self_id, is_muted, is_video_off))
            .await
    }

    async fn broadcast(
        &self,
        message: impl FnOnce(&str) -> SignalingMessage,
    ) -> Result<(), HuddleError> {
        let active = self.active.lock().await;
        let active = active
            .as_ref()
            .ok_or_else(|| HuddleError::TransportUnavailable("meeting not started".into()))?;
        active.signaling.send(&message(&active.self_id))?;
        Ok(())
    }

    async fn set_state(&self, state: SessionState) {
        publish_state(&self.state, &self.emitter, state).await;
    }

    async fn event_loop(
        engine: NegotiationEngine,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut teardown: mpsc::UnboundedReceiver<TeardownRequest>,
        emitter: EventEmitter,
        state: Arc<Mutex<SessionState>>,
    ) {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if signaling_open => match event {
                    Some(TransportEvent::Message(text)) => {
                        if let Err(e) = engine.handle_text(&text).await {
                            tracing::warn!("discarded signaling message: {e}");
                        }
                    }
                    Some(TransportEvent::Error(e)) => {
                        tracing::warn!("signaling error: {e}");
                        signaling_open = false;
                        publish_state(&state, &emitter, SessionState::SignalingLost).await;
                    }
                    Some(TransportEvent::Closed) | None => {
                        tracing::warn!("signaling closed, keeping established connections");
                        signaling_open = false;
                        publish_state(&state, &emitter, SessionState::SignalingLost).await;
                    }
                },
                Some(request) = teardown.recv() => engine.handle_teardown(request).await,
                else => break,
            }
        }
    }
}

async fn publish_state(state: &Mutex<SessionState>, emitter: &EventEmitter, new_state: SessionState) {
    *state.lock().await = new_state;
    emitter.emit(MeetingEvent::SessionStateChanged(new_state));
}
