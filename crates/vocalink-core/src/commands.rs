//! Dashboard commands, parsed once at the boundary into a closed set of actions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    StartAll,
    StopAll,
    StartOne,
    StopOne,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartAll => "start_all",
            Self::StopAll => "stop_all",
            Self::StartOne => "start_one",
            Self::StopOne => "stop_one",
        }
    }

    /// Case-insensitive: `START_ALL` and `start_all` are the same action.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "start_all" => Some(Self::StartAll),
            "stop_all" => Some(Self::StopAll),
            "start_one" => Some(Self::StartOne),
            "stop_one" => Some(Self::StopOne),
            _ => None,
        }
    }

    pub fn targets_one(&self) -> bool {
        matches!(self, Self::StartOne | Self::StopOne)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandTarget {
    All,
    One(SessionId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    action: Action,
    target: CommandTarget,
    trigger_time: Option<i64>,
}

impl Command {
    pub fn all(action: Action) -> Self {
        Self {
            action,
            target: CommandTarget::All,
            trigger_time: None,
        }
    }

    pub fn one(action: Action, session_id: SessionId) -> Self {
        Self {
            action,
            target: CommandTarget::One(session_id),
            trigger_time: None,
        }
    }

    pub fn with_trigger_time(mut self, trigger_time: Option<i64>) -> Self {
        self.trigger_time = trigger_time;
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn target(&self) -> &CommandTarget {
        &self.target
    }

    pub fn trigger_time(&self) -> Option<i64> {
        self.trigger_time
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let fields = CommandFields::extract(value)?;
        let command = if fields.action.targets_one() {
            let session_id = fields.session_id.ok_or(ProtocolError::MissingSessionId {
                action: fields.action.as_str(),
            })?;
            Self::one(fields.action, session_id)
        } else {
            Self::all(fields.action)
        };
        Ok(command.with_trigger_time(fields.trigger_time))
    }

    /// Parse an action message sent by a device. The sender is always the target,
    /// whatever `session_id` the message carries.
    pub fn parse_from_session(raw: &str, sender: &SessionId) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        let fields = CommandFields::extract(&value)?;
        Ok(Self::one(fields.action, sender.clone()).with_trigger_time(fields.trigger_time))
    }

    /// The message forwarded to sessions: `{action, session_id?, trigger_time?}`.
    pub fn to_wire(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("action".into(), Value::from(self.action.as_str()));
        if let CommandTarget::One(id) = &self.target {
            obj.insert("session_id".into(), Value::from(id.as_str()));
        }
        if let Some(t) = self.trigger_time {
            obj.insert("trigger_time".into(), Value::from(t));
        }
        Value::Object(obj)
    }
}

struct CommandFields {
    action: Action,
    session_id: Option<SessionId>,
    trigger_time: Option<i64>,
}

impl CommandFields {
    fn extract(value: &Value) -> Result<Self, ProtocolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedMessage("expected an object".into()))?;

        let raw_action = match obj.get("action") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingAction),
            Some(Value::String(s)) => s,
            Some(_) => return Err(ProtocolError::InvalidAction),
        };
        let action = Action::parse(raw_action)
            .ok_or_else(|| ProtocolError::UnknownAction(raw_action.clone()))?;

        let session_id = obj
            .get("session_id")
            .or_else(|| obj.get("sessionId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(SessionId::from_raw);
        let trigger_time = obj
            .get("trigger_time")
            .or_else(|| obj.get("triggerTime"))
            .and_then(Value::as_i64);

        Ok(Self {
            action,
            session_id,
            trigger_time,
        })
    }
}
