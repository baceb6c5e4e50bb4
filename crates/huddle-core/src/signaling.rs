//! Signaling wire protocol: one JSON object per message, tagged by `type`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::peer::{IceCandidate, SessionDescription};

const KNOWN_TYPES: &[&str] = &[
    "join",
    "leave",
    "user-joined",
    "user-left",
    "offer",
    "answer",
    "ice-candidate",
    "media-state-change",
    "screen-share-started",
    "screen-share-stopped",
];

/// Every message kind exchanged with the relay.
///
/// `from` is stamped by the sending client. Offers, answers and candidates
/// are directed and must carry `to`; everything else is broadcast by the
/// relay to the rest of the meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    Join {
        user_id: String,
        user_name: String,
        from: String,
    },
    Leave {
        user_id: String,
        from: String,
    },
    UserJoined {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },
    UserLeft {
        user_id: String,
    },
    Offer {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(deserialize_with = "offer_description")]
        sdp: SessionDescription,
    },
    Answer {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(deserialize_with = "answer_description")]
        sdp: SessionDescription,
    },
    IceCandidate {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        candidate: IceCandidate,
    },
    MediaStateChange {
        user_id: String,
        is_muted: bool,
        is_video_off: bool,
        #[serde(default)]
        from: String,
    },
    ScreenShareStarted {
        user_id: String,
        #[serde(default)]
        from: String,
    },
    ScreenShareStopped {
        user_id: String,
        #[serde(default)]
        from: String,
    },
}

impl SignalingMessage {
    pub fn join(self_id: &str, self_name: &str) -> Self {
        SignalingMessage::Join {
            user_id: self_id.to_string(),
            user_name: self_name.to_string(),
            from: self_id.to_string(),
        }
    }

    pub fn leave(self_id: &str) -> Self {
        SignalingMessage::Leave {
            user_id: self_id.to_string(),
            from: self_id.to_string(),
        }
    }

    pub fn offer(from: &str, to: &str, sdp: SessionDescription) -> Self {
        SignalingMessage::Offer {
            from: from.to_string(),
            to: Some(to.to_string()),
            sdp,
        }
    }

    pub fn answer(from: &str, to: &str, sdp: SessionDescription) -> Self {
        SignalingMessage::Answer {
            from: from.to_string(),
            to: Some(to.to_string()),
            sdp,
        }
    }

    pub fn ice_candidate(from: &str, to: &str, candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            from: from.to_string(),
            to: Some(to.to_string()),
            candidate,
        }
    }

    pub fn media_state(self_id: &str, is_muted: bool, is_video_off: bool) -> Self {
        SignalingMessage::MediaStateChange {
            user_id: self_id.to_string(),
            is_muted,
            is_video_off,
            from: self_id.to_string(),
        }
    }

    pub fn screen_share(self_id: &str, active: bool) -> Self {
        let (user_id, from) = (self_id.to_string(), self_id.to_string());
        if active {
            SignalingMessage::ScreenShareStarted { user_id, from }
        } else {
            SignalingMessage::ScreenShareStopped { user_id, from }
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::UserJoined { .. } => "user-joined",
            SignalingMessage::UserLeft { .. } => "user-left",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::MediaStateChange { .. } => "media-state-change",
            SignalingMessage::ScreenShareStarted { .. } => "screen-share-started",
            SignalingMessage::ScreenShareStopped { .. } => "screen-share-stopped",
        }
    }

    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::IceCandidate { .. }
        )
    }

    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. } => to.as_deref(),
            _ => None,
        }
    }

    /// Sender id, when the kind carries one and it is non-empty.
    pub fn sender(&self) -> Option<&str> {
        let from = match self {
            SignalingMessage::Join { from, .. }
            | SignalingMessage::Leave { from, .. }
            | SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. }
            | SignalingMessage::MediaStateChange { from, .. }
            | SignalingMessage::ScreenShareStarted { from, .. }
            | SignalingMessage::ScreenShareStopped { from, .. } => from,
            SignalingMessage::UserJoined { .. } | SignalingMessage::UserLeft { .. } => {
                return None;
            }
        };
        (!from.is_empty()).then_some(from.as_str())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Decode one inbound frame.
///
/// Unknown `type` tags are reported as [`ProtocolError::UnknownType`] so the
/// dispatcher can log and skip them.
pub fn decode(text: &str) -> Result<SignalingMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }

    let message: SignalingMessage =
        serde_json::from_value(value).map_err(ProtocolError::Malformed)?;
    if message.is_directed() && message.recipient().is_none() {
        return Err(ProtocolError::MissingRecipient(message.kind()));
    }
    if message.is_directed() && message.sender().is_none() {
        return Err(ProtocolError::MissingSender(message.kind()));
    }
    Ok(message)
}

/// Browsers send the full description object; some relays flatten it to
/// the bare SDP string.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireDescription {
    Full(SessionDescription),
    Bare(String),
}

fn offer_description<'de, D: Deserializer<'de>>(d: D) -> Result<SessionDescription, D::Error> {
    Ok(match WireDescription::deserialize(d)? {
        WireDescription::Full(description) => description,
        WireDescription::Bare(sdp) => SessionDescription::offer(sdp),
    })
}

fn answer_description<'de, D: Deserializer<'de>>(d: D) -> Result<SessionDescription, D::Error> {
    Ok(match WireDescription::deserialize(d)? {
        WireDescription::Full(description) => description,
        WireDescription::Bare(sdp) => SessionDescription::answer(sdp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SdpType;
    use serde_json::json;

    #[test]
    fn decodes_user_joined() {
        let msg = decode(r#"{"type":"user-joined","userId":"u2","userName":"Bob"}"#).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::UserJoined {
                user_id: "u2".into(),
                user_name: Some("Bob".into()),
            }
        );
        assert_eq!(msg.sender(), None);
    }

    #[test]
    fn decodes_offer_with_description_object() {
        let text = json!({
            "type": "offer",
            "from": "u3",
            "to": "u1",
            "sdp": { "type": "offer", "sdp": "v=0\r\n" },
        })
        .to_string();
        let msg = decode(&text).unwrap();
        assert_eq!(msg.sender(), Some("u3"));
        assert_eq!(msg.recipient(), Some("u1"));
        match msg {
            SignalingMessage::Offer { sdp, .. } => {
                assert_eq!(sdp.sdp_type, SdpType::Offer);
                assert_eq!(sdp.sdp, "v=0\r\n");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[test]
    fn bare_sdp_string_takes_type_from_message_kind() {
        let text = r#"{"type":"answer","from":"u2","to":"u1","sdp":"v=0"}"#;
        match decode(text).unwrap() {
            SignalingMessage::Answer { sdp, .. } => {
                assert_eq!(sdp, SessionDescription::answer("v=0"));
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn decodes_candidate() {
        let text = json!({
            "type": "ice-candidate",
            "from": "u2",
            "to": "u1",
            "candidate": { "candidate": "candidate:0 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0 },
        })
        .to_string();
        match decode(&text).unwrap() {
            SignalingMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let err = decode(r#"{"type":"raise-hand","userId":"u2"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "raise-hand"));
    }

    #[test]
    fn directed_message_without_recipient_is_rejected() {
        let err = decode(r#"{"type":"offer","from":"u2","sdp":"v=0"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingRecipient("offer")));

        let err = decode(r#"{"type":"answer","from":"","to":"u1","sdp":"v=0"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingSender("answer")));
    }

    #[test]
    fn missing_type_and_garbage_are_rejected() {
        assert!(matches!(decode(r#"{"userId":"u2"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"user-left"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn outbound_messages_use_camel_case_fields() {
        let value: Value =
            serde_json::from_str(&SignalingMessage::media_state("u1", true, false).encode().unwrap())
                .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "media-state-change",
                "userId": "u1",
                "isMuted": true,
                "isVideoOff": false,
                "from": "u1",
            })
        );

        let value: Value =
            serde_json::from_str(&SignalingMessage::join("u1", "Alice").encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "join", "userId": "u1", "userName": "Alice", "from": "u1" })
        );
    }

    #[test]
    fn outbound_offer_carries_recipient_and_description() {
        let msg = SignalingMessage::offer("u1", "u2", SessionDescription::offer("v=0"));
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["to"], "u2");
        assert_eq!(value["from"], "u1");
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn screen_share_kinds() {
        assert_eq!(SignalingMessage::screen_share("u1", true).kind(), "screen-share-started");
        assert_eq!(SignalingMessage::screen_share("u1", false).kind(), "screen-share-stopped");
        assert!(!SignalingMessage::screen_share("u1", true).is_directed());
    }
}
