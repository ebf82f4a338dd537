//! Session event types
//!
//! Every state transition of the session is mirrored as one of these
//! events, in addition to the human-readable status line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::CallState;
use crate::datalink::LinkState;
use crate::media::LensFacing;
use crate::payload::Payload;
use crate::session::SessionState;

/// Session event
///
/// Serialized as:
/// ```json
/// {
///   "event": "session.status_changed",
///   "data": { "state": "ready", "status": "Ready to call..." }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Lifecycle state or status text changed
    #[serde(rename = "session.status_changed")]
    StatusChanged { state: SessionState, status: String },

    /// Session torn down
    #[serde(rename = "session.ended")]
    SessionEnded,

    #[serde(rename = "call.state_changed")]
    CallStateChanged {
        state: CallState,
        /// Counterpart identifier, if a call exists
        #[serde(skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },

    /// Remote stream appeared or went away
    #[serde(rename = "call.remote_stream")]
    RemoteStreamChanged { available: bool },

    #[serde(rename = "link.state_changed")]
    DataLinkChanged { state: LinkState },

    /// A payload arrived over the data link
    #[serde(rename = "link.payload_received")]
    PayloadReceived {
        payload: Payload,
        received_at: DateTime<Utc>,
    },

    #[serde(rename = "media.mute_changed")]
    MuteChanged { muted: bool },

    #[serde(rename = "media.facing_changed")]
    FacingChanged { facing: LensFacing },

    /// The user stopped a screen share from outside the application
    #[serde(rename = "media.screen_share_ended")]
    ScreenShareEnded,
}

impl SessionEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "session.status_changed",
            Self::SessionEnded => "session.ended",
            Self::CallStateChanged { .. } => "call.state_changed",
            Self::RemoteStreamChanged { .. } => "call.remote_stream",
            Self::DataLinkChanged { .. } => "link.state_changed",
            Self::PayloadReceived { .. } => "link.payload_received",
            Self::MuteChanged { .. } => "media.mute_changed",
            Self::FacingChanged { .. } => "media.facing_changed",
            Self::ScreenShareEnded => "media.screen_share_ended",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports `*` for everything and `prefix.*` for one family.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = SessionEvent::StatusChanged {
            state: SessionState::Ready,
            status: "Ready to call...".to_string(),
        };
        assert_eq!(event.event_name(), "session.status_changed");
        assert_eq!(
            SessionEvent::MuteChanged { muted: true }.event_name(),
            "media.mute_changed"
        );
    }

    #[test]
    fn test_matches_topic() {
        let event = SessionEvent::DataLinkChanged {
            state: LinkState::Open,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("link.*"));
        assert!(event.matches_topic("link.state_changed"));
        assert!(!event.matches_topic("call.*"));
        assert!(!event.matches_topic("lin.*"));
    }

    #[test]
    fn test_serialization() {
        let event = SessionEvent::FacingChanged {
            facing: LensFacing::Front,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("media.facing_changed"));
        assert!(json.contains("front"));

        let deserialized: SessionEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            deserialized,
            SessionEvent::FacingChanged {
                facing: LensFacing::Front
            }
        ));
    }
}
