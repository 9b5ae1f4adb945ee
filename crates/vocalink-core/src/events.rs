use serde::{Deserialize, Serialize};

use crate::commands::Action;
use crate::ids::SessionId;
use crate::session::{epoch_millis, RecordingState, SessionMetadata};

pub const PROTOCOL_VERSION: f64 = 1.0;

/// Server-originated notifications. One case per event kind, each with its own body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "snake_case")]
pub enum WsEvent {
    /// Sent to a session once its connection claims the staged record.
    SessionInit(SessionMetadata),

    /// Sent to the dashboard for each active session: on claim, and as the connect snapshot.
    SessionRegistered(SessionMetadata),

    SessionUnregistered { session_id: SessionId },

    /// Broadcast to every active session after the server is renamed.
    DashboardRename(String),

    SessionState {
        session_id: SessionId,
        state: RecordingState,
    },

    /// An action message a device sent back, relayed to the dashboard.
    SessionAction {
        session_id: SessionId,
        action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_time: Option<i64>,
    },
}

impl WsEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionInit(_) => "session_init",
            Self::SessionRegistered(_) => "session_registered",
            Self::SessionUnregistered { .. } => "session_unregistered",
            Self::DashboardRename(_) => "dashboard_rename",
            Self::SessionState { .. } => "session_state",
            Self::SessionAction { .. } => "session_action",
        }
    }

    /// Wrap in a versioned, timestamped envelope and serialize.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            version: PROTOCOL_VERSION,
            timestamp: epoch_millis(),
            event: self,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: f64,
    timestamp: i64,
    #[serde(flatten)]
    event: &'a WsEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RegistrationRequest;

    fn decode(event: &WsEvent) -> serde_json::Value {
        serde_json::from_str(&event.encode().unwrap()).unwrap()
    }

    #[test]
    fn rename_envelope_shape() {
        let json = decode(&WsEvent::DashboardRename("Studio B".into()));
        assert_eq!(json["event"], "dashboard_rename");
        assert_eq!(json["body"], "Studio B");
        assert_eq!(json["version"], 1.0);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn session_registered_carries_metadata() {
        let req = RegistrationRequest::new("Mic A", "10.0.0.4", None).unwrap();
        let meta = SessionMetadata::new(SessionId::from_raw("sess_1"), req);
        let json = decode(&WsEvent::SessionRegistered(meta));
        assert_eq!(json["event"], "session_registered");
        assert_eq!(json["body"]["id"], "sess_1");
        assert_eq!(json["body"]["name"], "Mic A");
    }

    #[test]
    fn unregistered_body_is_object() {
        let json = decode(&WsEvent::SessionUnregistered {
            session_id: SessionId::from_raw("sess_9"),
        });
        assert_eq!(json["body"]["session_id"], "sess_9");
    }

    #[test]
    fn session_action_omits_missing_trigger_time() {
        let json = decode(&WsEvent::SessionAction {
            session_id: SessionId::from_raw("sess_2"),
            action: Action::StopOne,
            trigger_time: None,
        });
        assert_eq!(json["body"]["action"], "stop_one");
        assert!(json["body"].get("trigger_time").is_none());
    }

    #[test]
    fn event_type_matches_tag() {
        let events = [
            WsEvent::DashboardRename("x".into()),
            WsEvent::SessionUnregistered {
                session_id: SessionId::new(),
            },
            WsEvent::SessionState {
                session_id: SessionId::new(),
                state: RecordingState::Recording,
            },
        ];
        for event in &events {
            assert_eq!(decode(event)["event"], event.event_type());
        }
    }
}
