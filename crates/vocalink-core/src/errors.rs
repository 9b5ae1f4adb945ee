/// Malformed or unrecognised client messages.
/// Reported back to the sender as `{"error": CODE, "message": ...}`; the connection stays open.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not a JSON object: {0}")]
    MalformedMessage(String),
    #[error("missing action")]
    MissingAction,
    #[error("action must be a string")]
    InvalidAction,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("{action} requires a session_id")]
    MissingSessionId { action: &'static str },
    #[error("sync frame is neither a ping nor a report")]
    MalformedSync,
}

impl ProtocolError {
    /// Wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::MissingAction => "MISSING_ACTION",
            Self::InvalidAction => "INVALID_ACTION",
            Self::UnknownAction(_) => "UNKNOWN_ACTION",
            Self::MissingSessionId { .. } => "MISSING_SESSION_ID",
            Self::MalformedSync => "MALFORMED_SYNC",
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name must be between {min} and {max} characters, got {len}")]
    InvalidName { min: usize, max: usize, len: usize },
    #[error("battery level must be between 0 and 100, got {0}")]
    InvalidBatteryLevel(i64),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName { .. } => "INVALID_NAME",
            Self::InvalidBatteryLevel(_) => "INVALID_BATTERY_LEVEL",
        }
    }
}

/// Send failures on a connection handle. Callers treat both as an implicit disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("send queue full")]
    Full,
}
