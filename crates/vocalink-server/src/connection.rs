//! Owned connection handles.
//!
//! A [`Connection`] is the single capability for one peer socket. It is not
//! `Clone`: exactly one container (registry entry, dashboard slot, sync map)
//! owns it, and dropping it closes the peer. Sends go through an [`Outbox`],
//! a cloneable send-only view that can be copied out from under a lock so the
//! actual send happens after the lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use vocalink_core::{ConnectionError, ConnectionId, WsEvent};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Frames queued for the transport's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Send-only view of a connection.
#[derive(Clone, Debug)]
pub struct Outbox {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl Outbox {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Whether the handle was closed or the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }
        self.tx.try_send(Outbound::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::Full,
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ConnectionError> {
        match serde_json::to_string(value) {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!(conn_id = %self.id, error = %e, "failed to serialize outbound message");
                Ok(())
            }
        }
    }

    pub fn send_event(&self, event: &WsEvent) -> Result<(), ConnectionError> {
        match event.encode() {
            Ok(json) => self.send_text(json),
            Err(e) => {
                tracing::error!(conn_id = %self.id, event = event.event_type(), error = %e, "failed to encode event");
                Ok(())
            }
        }
    }
}

/// Exclusive handle to a peer connection.
#[derive(Debug)]
pub struct Connection {
    outbox: Outbox,
}

impl Connection {
    /// Create a handle and the receiving end its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let outbox = Outbox {
            id: ConnectionId::new(),
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (Self { outbox }, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        self.outbox.id()
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.outbox.send_text(text)
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ConnectionError> {
        self.outbox.send_json(value)
    }

    pub fn send_event(&self, event: &WsEvent) -> Result<(), ConnectionError> {
        self.outbox.send_event(event)
    }

    /// Queue a close frame and refuse further sends. Idempotent; a failed close is ignored.
    pub fn close(&self, code: u16, reason: &str) {
        if self.outbox.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let frame = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if self.outbox.tx.try_send(frame).is_err() {
            tracing::debug!(conn_id = %self.outbox.id, "close frame not queued, writer already gone or full");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CLOSE_NORMAL, "");
    }
}
