//! `huddle-join`: join a meeting as a receive-only participant and log what
//! happens until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use huddle_core::{
    MeetingEvent, MeetingEventListener, MeetingLink, MeetingSession, SettingsStore, WsConnector,
};
use huddle_webrtc::WebRtcPeerFactory;
use url::Url;

struct LoggingListener;

impl MeetingEventListener for LoggingListener {
    fn on_event(&self, event: MeetingEvent) {
        match event {
            MeetingEvent::SessionStateChanged(state) => {
                tracing::info!(?state, "session state");
            }
            MeetingEvent::ParticipantJoined {
                participant_id,
                name,
            } => {
                tracing::info!(participant = %participant_id, name = ?name, "joined");
            }
            MeetingEvent::ParticipantLeft(participant_id) => {
                tracing::info!(participant = %participant_id, "left");
            }
            MeetingEvent::RemoteTrackAdded {
                participant_id,
                stream_id,
                track,
            } => {
                tracing::info!(
                    participant = %participant_id,
                    stream = %stream_id,
                    track = %track.id,
                    kind = ?track.kind,
                    "receiving track"
                );
            }
            MeetingEvent::ParticipantConnectionStateChanged {
                participant_id,
                state,
            } => {
                tracing::info!(participant = %participant_id, ?state, "connection state");
            }
            MeetingEvent::NegotiationFailed {
                participant_id,
                reason,
            } => {
                tracing::warn!(participant = %participant_id, %reason, "negotiation failed");
            }
            MeetingEvent::MediaStateChanged {
                participant_id,
                is_muted,
                is_video_off,
            } => {
                tracing::info!(participant = %participant_id, is_muted, is_video_off, "media state");
            }
            MeetingEvent::ScreenShareChanged {
                participant_id,
                active,
            } => {
                tracing::info!(participant = %participant_id, active, "screen share");
            }
        }
    }
}

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "huddle_core=debug,huddle_webrtc=info,huddle_join=info,webrtc=warn".into()),
            )
            .with_target(true)
            .init();
    });
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HUDDLE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .map(|dir| dir.join("huddle"))
        .unwrap_or_else(|| PathBuf::from(".huddle"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let Some(link) = args.next() else {
        bail!("usage: huddle-join <meeting-link> [display-name]");
    };
    let link = MeetingLink::parse(&link)?;

    let data_dir = data_dir();
    let store = SettingsStore::new(&data_dir);
    if let Some(name) = args.next() {
        if let Err(e) = store.set_display_name(Some(name)) {
            tracing::warn!("display name not saved: {e}");
        }
    }
    let settings = store.get();

    let signaling_url = match &settings.signaling_url {
        Some(url) => Url::parse(url).with_context(|| format!("invalid signaling_url '{url}'"))?,
        None => link.signaling_url.clone(),
    };
    let self_id = uuid::Uuid::new_v4().to_string();
    let display_name = settings
        .display_name
        .clone()
        .unwrap_or_else(|| format!("guest-{}", &self_id[..8]));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        meeting = %link.meeting_id,
        relay = %signaling_url,
        name = %display_name,
        "huddle-join starting"
    );

    let factory = WebRtcPeerFactory::new(&settings.ice_servers)?;
    let session = MeetingSession::new(signaling_url, Arc::new(WsConnector), Arc::new(factory));
    session.add_listener(Arc::new(LoggingListener));

    session
        .start(&link.meeting_id, &self_id, &display_name, Vec::new())
        .await?;
    // Nothing is captured here, so announce ourselves muted with the camera off.
    if let Err(e) = session.notify_media_state(true, true).await {
        tracing::warn!("media state not sent: {e}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("leaving meeting");
    session.stop().await;
    Ok(())
}
