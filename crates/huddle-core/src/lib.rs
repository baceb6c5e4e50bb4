//! Huddle core: peer-connection negotiation for full-mesh meetings.
//!
//! Pure Rust crate with no media dependencies. The host supplies a
//! [`PeerConnectionFactory`] and a [`SignalingConnector`]; the core drives
//! offer/answer/ICE exchange with every other participant.

mod connection;
mod negotiation;
#[cfg(test)]
mod testing;

pub mod directory;
pub mod errors;
pub mod events;
pub mod link;
pub mod meeting;
pub mod peer;
pub mod settings;
pub mod signaling;
pub mod tracks;
pub mod transport;

pub use connection::ConnectionStatus;
pub use errors::{HuddleError, PeerError, ProtocolError, TransportError};
pub use events::{MeetingEvent, MeetingEventListener, SessionState};
pub use link::MeetingLink;
pub use meeting::MeetingSession;
pub use peer::{
    IceCandidate, MediaTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSender,
    SessionDescription, TrackKind, TrackSource,
};
pub use settings::{IceServer, Settings, SettingsStore};
pub use tracks::LocalTrackBinding;
pub use transport::{SignalingConnector, WsConnector};
