//! Clock-sync exchange messages. The server only witnesses timestamps; offset math happens on the device.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

pub const SYNC_RESPONSE_TYPE: &str = "SYNC_RESPONSE";

/// Client ping carrying its send time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub t1: i64,
}

/// Server pong: client send time, server receive time, server send time (epoch ms).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
}

impl SyncResponse {
    pub fn new(t1: i64, t2: i64, t3: i64) -> Self {
        Self {
            kind: SYNC_RESPONSE_TYPE.to_string(),
            t1,
            t2,
            t3,
        }
    }
}

/// Offset and round-trip estimate computed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub theta: f64,
    pub rtt: f64,
}

/// Any frame a device may send on its sync channel.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SyncFrame {
    Report(SyncReport),
    Ping(SyncRequest),
}

impl SyncFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|_| ProtocolError::MalformedSync)
    }
}
