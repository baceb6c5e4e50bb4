use crate::connection::PeerCommand;
use crate::directory::SessionDirectory;
use crate::events::{EventEmitter, MeetingEvent};
use crate::peer::{MediaTrack, RemoteTrack, TrackKind, TrackSource};
use crate::signaling::SignalingMessage;

/// A local track published to the mesh.
///
/// Screen-share bindings are transient: they come and go while the meeting
/// runs and every change renegotiates each connection.
#[derive(Debug, Clone)]
pub struct LocalTrackBinding {
    pub track: MediaTrack,
    pub stream_id: String,
    pub source: TrackSource,
}

impl LocalTrackBinding {
    pub fn new(track: MediaTrack, stream_id: impl Into<String>, source: TrackSource) -> Self {
        Self {
            track,
            stream_id: stream_id.into(),
            source,
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track.id
    }

    pub fn kind(&self) -> TrackKind {
        self.track.kind
    }
}

/// Keeps the set of local tracks mirrored across every participant
/// connection.
///
/// Connections created later pick up [`TrackRouter::bindings`] at creation,
/// so only existing connections are touched on attach and detach.
#[derive(Debug, Default)]
pub struct TrackRouter {
    bindings: Vec<LocalTrackBinding>,
}

impl TrackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> Vec<LocalTrackBinding> {
        self.bindings.clone()
    }

    pub fn binding(&self, track_id: &str) -> Option<&LocalTrackBinding> {
        self.bindings.iter().find(|b| b.track_id() == track_id)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.bindings.iter().any(|b| b.source == TrackSource::Screen)
    }

    /// Record a binding and bind it on every existing connection. Each
    /// connection renegotiates on its own once the track is added.
    ///
    /// Returns `false` if a track with the same id is already bound.
    pub fn attach(&mut self, binding: LocalTrackBinding, directory: &SessionDirectory) -> bool {
        if self.binding(binding.track_id()).is_some() {
            tracing::debug!(track = binding.track_id(), "track already attached");
            return false;
        }
        tracing::info!(
            track = binding.track_id(),
            kind = ?binding.kind(),
            source = ?binding.source,
            connections = directory.len(),
            "attaching local track"
        );
        directory.for_each(|connection| {
            connection.enqueue(PeerCommand::AttachTrack(binding.clone()));
        });
        self.bindings.push(binding);
        true
    }

    /// Remove a binding and unbind it from every connection carrying it.
    /// Connections that never bound the track ignore the request.
    pub fn detach(
        &mut self,
        track_id: &str,
        directory: &SessionDirectory,
    ) -> Option<LocalTrackBinding> {
        let index = self.bindings.iter().position(|b| b.track_id() == track_id)?;
        let binding = self.bindings.remove(index);
        tracing::info!(track = track_id, "detaching local track");
        directory.for_each(|connection| {
            connection.enqueue(PeerCommand::DetachTrack(track_id.to_string()));
        });
        Some(binding)
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Hand an inbound track to the application. Audio and video of one
/// participant arrive as separate events sharing a stream id.
pub(crate) fn surface_remote_track(emitter: &EventEmitter, participant_id: &str, track: RemoteTrack) {
    tracing::info!(
        participant = participant_id,
        track = %track.id,
        kind = ?track.kind,
        "remote track added"
    );
    emitter.emit(MeetingEvent::RemoteTrackAdded {
        participant_id: participant_id.to_string(),
        stream_id: track.stream_id.clone(),
        track,
    });
}

/// Forward media-state broadcasts as application hints. They never touch
/// negotiation; the tracks themselves travel through offers and answers.
pub(crate) fn forward_media_state(emitter: &EventEmitter, message: &SignalingMessage) {
    let event = match message {
        SignalingMessage::MediaStateChange {
            user_id,
            is_muted,
            is_video_off,
            ..
        } => MeetingEvent::MediaStateChanged {
            participant_id: participant_of(message, user_id),
            is_muted: *is_muted,
            is_video_off: *is_video_off,
        },
        SignalingMessage::ScreenShareStarted { user_id, .. } => MeetingEvent::ScreenShareChanged {
            participant_id: participant_of(message, user_id),
            active: true,
        },
        SignalingMessage::ScreenShareStopped { user_id, .. } => MeetingEvent::ScreenShareChanged {
            participant_id: participant_of(message, user_id),
            active: false,
        },
        _ => return,
    };
    emitter.emit(event);
}

// The relay-stamped sender wins over the self-declared user id.
fn participant_of(message: &SignalingMessage, user_id: &str) -> String {
    message.sender().unwrap_or(user_id).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, video_track};
    use std::sync::Arc;

    #[test]
    fn attach_rejects_duplicate_track_ids() {
        let directory = SessionDirectory::new();
        let mut router = TrackRouter::new();

        assert!(router.attach(
            LocalTrackBinding::new(video_track("cam"), "s1", TrackSource::Camera),
            &directory
        ));
        assert!(!router.attach(
            LocalTrackBinding::new(video_track("cam"), "s1", TrackSource::Camera),
            &directory
        ));
        assert_eq!(router.bindings().len(), 1);
    }

    #[test]
    fn detach_removes_binding_and_screen_state() {
        let directory = SessionDirectory::new();
        let mut router = TrackRouter::new();
        router.attach(
            LocalTrackBinding::new(video_track("screen"), "s2", TrackSource::Screen),
            &directory,
        );
        assert!(router.is_screen_sharing());

        let removed = router.detach("screen", &directory).unwrap();
        assert_eq!(removed.stream_id, "s2");
        assert!(!router.is_screen_sharing());
        assert!(router.detach("screen", &directory).is_none());
    }

    #[test]
    fn media_state_prefers_stamped_sender() {
        let emitter = EventEmitter::new();
        let log = EventLog::default();
        emitter.add_listener(Arc::new(log.clone()));

        forward_media_state(
            &emitter,
            &SignalingMessage::MediaStateChange {
                user_id: "spoofed".into(),
                is_muted: true,
                is_video_off: false,
                from: "u2".into(),
            },
        );
        forward_media_state(
            &emitter,
            &SignalingMessage::ScreenShareStopped {
                user_id: "u3".into(),
                from: String::new(),
            },
        );
        forward_media_state(&emitter, &SignalingMessage::UserLeft { user_id: "u4".into() });

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            MeetingEvent::MediaStateChanged { participant_id, is_muted: true, is_video_off: false }
                if participant_id == "u2"
        ));
        assert!(matches!(
            &events[1],
            MeetingEvent::ScreenShareChanged { participant_id, active: false } if participant_id == "u3"
        ));
    }
}
