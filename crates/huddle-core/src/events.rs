use std::sync::{Arc, PoisonError, RwLock};

use crate::peer::{PeerConnectionState, RemoteTrack};

/// Events emitted by the core to the application layer.
#[derive(Debug, Clone)]
pub enum MeetingEvent {
    SessionStateChanged(SessionState),
    ParticipantJoined {
        participant_id: String,
        name: Option<String>,
    },
    ParticipantLeft(String), // participant id
    RemoteTrackAdded {
        participant_id: String,
        stream_id: String,
        track: RemoteTrack,
    },
    ParticipantConnectionStateChanged {
        participant_id: String,
        state: PeerConnectionState,
    },
    NegotiationFailed {
        participant_id: String,
        reason: String,
    },
    MediaStateChanged {
        participant_id: String,
        is_muted: bool,
        is_video_off: bool,
    },
    ScreenShareChanged {
        participant_id: String,
        active: bool,
    },
}

/// State of the signaling side of a meeting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Joined,
    /// The signaling channel dropped. Established media keeps flowing but
    /// no further negotiation happens.
    SignalingLost,
    Stopped,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait MeetingEventListener: Send + Sync {
    fn on_event(&self, event: MeetingEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn MeetingEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MeetingEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: MeetingEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}
