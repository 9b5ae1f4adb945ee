//! Session and server identity data model.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::SessionId;

pub const NAME_MIN_LEN: usize = 1;
pub const NAME_MAX_LEN: usize = 50;

/// Application-level status reported by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Uploading,
    Error,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Uploading => "uploading",
            Self::Error => "error",
        }
    }
}

/// Metadata for one recording device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub name: String,
    pub ip: String,
    pub state: RecordingState,
    pub battery_level: Option<u8>,
    /// Clock offset reported by the device.
    pub theta: f64,
    pub last_rtt: f64,
    /// Epoch milliseconds of the last accepted sync report.
    pub last_sync: Option<i64>,
}

impl SessionMetadata {
    /// Build a fresh record from a validated request. Application fields start at their defaults.
    pub fn new(id: SessionId, request: RegistrationRequest) -> Self {
        Self {
            id,
            name: request.name,
            ip: request.ip,
            state: RecordingState::Idle,
            battery_level: request.battery_level,
            theta: 0.0,
            last_rtt: 0.0,
            last_sync: None,
        }
    }

    pub fn record_sync(&mut self, theta: f64, rtt: f64, at_ms: i64) {
        self.theta = theta;
        self.last_rtt = rtt;
        self.last_sync = Some(at_ms);
    }
}

/// Validated registration input. Construct through [`RegistrationRequest::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationRequest {
    name: String,
    ip: String,
    battery_level: Option<u8>,
}

impl RegistrationRequest {
    pub fn new(
        name: &str,
        ip: impl Into<String>,
        battery_level: Option<i64>,
    ) -> Result<Self, ValidationError> {
        let name = validate_name(name)?;
        let battery_level = match battery_level {
            None => None,
            Some(level) => Some(
                u8::try_from(level)
                    .ok()
                    .filter(|l| *l <= 100)
                    .ok_or(ValidationError::InvalidBatteryLevel(level))?,
            ),
        };
        Ok(Self {
            name,
            ip: ip.into(),
            battery_level,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Trim and length-check a human-readable name.
pub fn validate_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return Err(ValidationError::InvalidName {
            min: NAME_MIN_LEN,
            max: NAME_MAX_LEN,
            len,
        });
    }
    Ok(trimmed.to_string())
}

/// Result of an identity query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub ip: String,
    pub session_count: usize,
}

/// Wall-clock epoch milliseconds.
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
