//! Session lifecycle notifications. The core publishes, renderers subscribe;
//! nothing in here calls back into UI code.

use serde::Serialize;

/// Which transport a session reaches phones over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPath {
    Relay,
    Local,
}

/// Why a session cannot proceed without user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockedReason {
    /// No usable credential (no device token and no event secret).
    Missing,
    /// The relay rejected the credential we presented.
    Invalid,
    /// Something unexpected; see the attached message.
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SessionEvent {
    SessionOpened {
        image_id: String,
        session_id: String,
        path: SessionPath,
    },
    SessionConnected {
        image_id: String,
        session_id: String,
    },
    SessionClosed {
        image_id: String,
        session_id: String,
    },
    SessionBlocked {
        image_id: String,
        reason: BlockedReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Auto mode fell back to the LAN path for this image; shown as a banner.
    DegradedToLocal {
        image_id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let event = SessionEvent::SessionOpened {
            image_id: "img-1".into(),
            session_id: "ABCDEFGHJK".into(),
            path: SessionPath::Relay,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session-opened");
        assert_eq!(json["data"]["imageId"], "img-1");
        assert_eq!(json["data"]["sessionId"], "ABCDEFGHJK");
        assert_eq!(json["data"]["path"], "relay");
    }

    #[test]
    fn blocked_event_omits_absent_message() {
        let event = SessionEvent::SessionBlocked {
            image_id: "img-1".into(),
            reason: BlockedReason::Missing,
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["reason"], "missing");
        assert!(json["data"].get("message").is_none());
    }
}
