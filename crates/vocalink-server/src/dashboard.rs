//! Single-slot holder for the administrative connection.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use vocalink_core::{ConnectionId, WsEvent};

use crate::connection::{Connection, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};

pub const ALREADY_CONNECTED: &str = "ALREADY_CONNECTED";

#[derive(Debug, PartialEq, Eq)]
pub enum DashboardConnect {
    /// The connection now occupies the slot. The id is the token for [`DashboardChannel::release`].
    Accepted(ConnectionId),
    /// The slot was taken; the new connection was told why and closed.
    Rejected,
}

#[derive(Default)]
pub struct DashboardChannel {
    slot: Mutex<Option<Connection>>,
}

impl DashboardChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, connection: Connection) -> DashboardConnect {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            drop(slot);
            warn!(conn_id = %connection.id(), "dashboard already connected, rejecting");
            let payload = json!({
                "error": ALREADY_CONNECTED,
                "message": "a dashboard is already connected",
            });
            let _ = connection.send_json(&payload);
            connection.close(CLOSE_POLICY_VIOLATION, ALREADY_CONNECTED);
            return DashboardConnect::Rejected;
        }
        let id = connection.id().clone();
        *slot = Some(connection);
        info!(conn_id = %id, "dashboard connected");
        DashboardConnect::Accepted(id)
    }

    /// Clear the slot and close the occupant. Idempotent.
    pub fn disconnect(&self) {
        let previous = self.slot.lock().take();
        if let Some(connection) = previous {
            connection.close(CLOSE_NORMAL, "");
            info!(conn_id = %connection.id(), "dashboard disconnected");
        }
    }

    /// Clear the slot only if `token` still occupies it. Returns whether it did.
    pub fn release(&self, token: &ConnectionId) -> bool {
        let previous = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(connection) if connection.id() == token => slot.take(),
                _ => None,
            }
        };
        match previous {
            Some(connection) => {
                connection.close(CLOSE_NORMAL, "");
                info!(conn_id = %token, "dashboard released");
                true
            }
            None => false,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Send raw text to the occupant. A failed send disconnects it.
    pub fn notify_text(&self, text: String) -> bool {
        let Some(outbox) = self.slot.lock().as_ref().map(Connection::outbox) else {
            debug!("no dashboard connected, dropping notification");
            return false;
        };
        match outbox.send_text(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id = %outbox.id(), error = %e, "dashboard unreachable, disconnecting");
                self.release(outbox.id());
                false
            }
        }
    }

    pub fn notify(&self, event: &WsEvent) -> bool {
        match event.encode() {
            Ok(json) => self.notify_text(json),
            Err(e) => {
                warn!(event = event.event_type(), error = %e, "failed to encode dashboard event");
                false
            }
        }
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.notify_text(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize dashboard message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;

    #[test]
    fn first_connect_accepted() {
        let channel = DashboardChannel::new();
        let (conn, _rx) = Connection::new(8);
        let id = conn.id().clone();
        assert_eq!(channel.connect(conn), DashboardConnect::Accepted(id));
        assert!(channel.is_occupied());
    }

    #[test]
    fn second_connect_rejected_first_kept() {
        let channel = DashboardChannel::new();
        let (first, mut first_rx) = Connection::new(8);
        let (second, mut second_rx) = Connection::new(8);
        channel.connect(first);

        assert_eq!(channel.connect(second), DashboardConnect::Rejected);
        assert!(channel.is_occupied());

        let Outbound::Text(text) = second_rx.try_recv().unwrap() else {
            panic!("expected error payload first");
        };
        let payload: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["error"], ALREADY_CONNECTED);
        assert_eq!(
            second_rx.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: ALREADY_CONNECTED.into()
            }
        );

        assert!(channel.notify_text("still here".into()));
        assert_eq!(first_rx.try_recv().unwrap(), Outbound::Text("still here".into()));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let channel = DashboardChannel::new();
        let (conn, mut rx) = Connection::new(8);
        channel.connect(conn);
        channel.disconnect();
        channel.disconnect();
        assert!(!channel.is_occupied());
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: CLOSE_NORMAL, .. }));
    }

    #[test]
    fn slot_reusable_after_disconnect() {
        let channel = DashboardChannel::new();
        let (a, _ra) = Connection::new(8);
        let (b, _rb) = Connection::new(8);
        channel.connect(a);
        channel.disconnect();
        assert!(matches!(channel.connect(b), DashboardConnect::Accepted(_)));
    }

    #[test]
    fn stale_release_keeps_newer_dashboard() {
        let channel = DashboardChannel::new();
        let (a, _ra) = Connection::new(8);
        let DashboardConnect::Accepted(stale) = channel.connect(a) else {
            panic!("expected accept");
        };
        channel.disconnect();
        let (b, _rb) = Connection::new(8);
        channel.connect(b);

        assert!(!channel.release(&stale));
        assert!(channel.is_occupied());
    }

    #[test]
    fn notify_without_dashboard_is_noop() {
        let channel = DashboardChannel::new();
        assert!(!channel.notify(&WsEvent::DashboardRename("x".into())));
    }

    #[test]
    fn failed_notify_disconnects() {
        let channel = DashboardChannel::new();
        let (conn, rx) = Connection::new(8);
        channel.connect(conn);
        drop(rx);
        assert!(!channel.notify(&WsEvent::DashboardRename("x".into())));
        assert!(!channel.is_occupied());
    }
}
