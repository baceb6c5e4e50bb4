use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::errors::HuddleError;

static MEETING_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("meeting id pattern is valid")
});

/// A meeting link resolved into the relay endpoint and the meeting id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingLink {
    /// WebSocket URL of the signaling relay, without the meeting id.
    pub signaling_url: Url,
    pub meeting_id: String,
}

impl MeetingLink {
    /// Parse user input into a meeting link.
    ///
    /// Accepts `https://host/room` (relay at `wss://host/ws`),
    /// `wss://host/ws/room` (relay at `wss://host/ws`) and bare
    /// `host/room`, which is treated as https.
    pub fn parse(input: &str) -> Result<Self, HuddleError> {
        let input = input.trim().trim_end_matches('/');
        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("https://{input}")
        };
        let mut url = Url::parse(&with_scheme)
            .map_err(|e| HuddleError::InvalidUrl(format!("'{input}': {e}")))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(HuddleError::InvalidUrl(format!("'{input}' has no host")));
        }

        let mut segments: Vec<String> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        let meeting_id = segments.pop().ok_or_else(|| {
            HuddleError::InvalidUrl(format!("expected 'host/meeting-id', got '{input}'"))
        })?;
        validate_meeting_id(&meeting_id)?;

        // Web links serve the relay under <prefix>/ws.
        if matches!(url.scheme(), "http" | "https") {
            segments.push("ws".to_string());
        }
        to_websocket_scheme(&mut url)?;
        url.set_path(&format!("/{}", segments.join("/")));
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            signaling_url: url,
            meeting_id,
        })
    }
}

/// Meeting ids: 1 to 64 ASCII letters, digits, `-` or `_`, starting with a
/// letter or digit.
pub fn validate_meeting_id(meeting_id: &str) -> Result<(), HuddleError> {
    if MEETING_ID.is_match(meeting_id) {
        Ok(())
    } else {
        Err(HuddleError::InvalidUrl(format!(
            "invalid meeting id '{meeting_id}'"
        )))
    }
}

/// The URL to open for `meeting_id` on the relay at `signaling_url`.
pub fn endpoint_for(signaling_url: &Url, meeting_id: &str) -> Result<Url, HuddleError> {
    validate_meeting_id(meeting_id)?;
    let mut url = signaling_url.clone();
    to_websocket_scheme(&mut url)?;
    url.query_pairs_mut().append_pair("meetingId", meeting_id);
    Ok(url)
}

fn to_websocket_scheme(url: &mut Url) -> Result<(), HuddleError> {
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(HuddleError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| HuddleError::InvalidUrl(format!("cannot use scheme '{scheme}'")))
}
