//! Per-session clock-sync channels.
//!
//! The relay is a timestamp witness: it stamps receive and send times on a
//! device ping and stores whatever offset the device later reports. All
//! offset arithmetic stays on the device.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use vocalink_core::session::epoch_millis;
use vocalink_core::{ConnectionId, ProtocolError, SessionId, SyncFrame, SyncResponse};

use crate::connection::{Connection, CLOSE_GOING_AWAY, CLOSE_NORMAL};
use crate::registry::SessionRegistry;

pub const REPLACED: &str = "REPLACED";

/// Epoch-millisecond clock that never runs backwards.
#[derive(Debug, Default)]
pub struct WitnessClock {
    last: AtomicI64,
}

impl WitnessClock {
    pub fn now(&self) -> i64 {
        let wall = epoch_millis();
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

/// What happened to one inbound sync frame.
#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    Ponged(SyncResponse),
    /// The channel is gone; nothing was sent.
    Dropped,
    /// Report accepted; `false` if the session had already ended.
    Reported(bool),
    Rejected(ProtocolError),
}

pub struct SyncRelay {
    registry: Arc<SessionRegistry>,
    channels: DashMap<SessionId, Connection>,
    clock: WitnessClock,
}

impl SyncRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
            clock: WitnessClock::default(),
        }
    }

    /// Register the sync channel for an active session. A previous channel for
    /// the same session is closed. Returns the token for [`SyncRelay::release`].
    pub fn open(&self, id: SessionId, connection: Connection) -> ConnectionId {
        let token = connection.id().clone();
        let previous = self.channels.insert(id.clone(), connection);
        if let Some(old) = previous {
            debug!(session_id = %id, "replacing sync channel");
            old.close(CLOSE_GOING_AWAY, REPLACED);
        }
        info!(session_id = %id, "sync channel open");
        token
    }

    /// Stamp t2/t3 for a device ping and send the triple back on the same channel.
    pub fn handle_ping(&self, id: &SessionId, t1: i64) -> Option<SyncResponse> {
        let outbox = self.channels.get(id).map(|c| c.outbox())?;
        let t2 = self.clock.now();
        let response = SyncResponse::new(t1, t2, self.clock.now());
        match outbox.send_json(&response) {
            Ok(()) => Some(response),
            Err(e) => {
                warn!(session_id = %id, error = %e, "sync reply failed, closing channel");
                self.release(id, outbox.id());
                None
            }
        }
    }

    pub fn report(&self, id: &SessionId, theta: f64, rtt: f64) -> bool {
        let updated = self.registry.update_sync(id, theta, rtt);
        if updated {
            debug!(session_id = %id, theta, rtt, "sync report stored");
        } else {
            debug!(session_id = %id, "sync report for inactive session ignored");
        }
        updated
    }

    /// Route one raw frame from a sync channel.
    pub fn handle_frame(&self, id: &SessionId, raw: &str) -> SyncOutcome {
        match SyncFrame::parse(raw) {
            Ok(SyncFrame::Ping(ping)) => match self.handle_ping(id, ping.t1) {
                Some(response) => SyncOutcome::Ponged(response),
                None => SyncOutcome::Dropped,
            },
            Ok(SyncFrame::Report(report)) => SyncOutcome::Reported(self.report(id, report.theta, report.rtt)),
            Err(err) => {
                debug!(session_id = %id, "malformed sync frame");
                let outbox = self.channels.get(id).map(|c| c.outbox());
                if let Some(outbox) = outbox {
                    let _ = outbox.send_json(&err.to_payload());
                }
                SyncOutcome::Rejected(err)
            }
        }
    }

    /// Remove and close the channel for a session. Idempotent.
    pub fn close(&self, id: &SessionId) -> bool {
        let removed = self.channels.remove(id);
        match removed {
            Some((_, connection)) => {
                connection.close(CLOSE_NORMAL, "");
                info!(session_id = %id, "sync channel closed");
                true
            }
            None => false,
        }
    }

    /// Close the channel only if `token` is still the registered one.
    pub fn release(&self, id: &SessionId, token: &ConnectionId) -> bool {
        let removed = self.channels.remove_if(id, |_, connection| connection.id() == token);
        match removed {
            Some((_, connection)) => {
                connection.close(CLOSE_NORMAL, "");
                debug!(session_id = %id, "sync channel released");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, id: &SessionId) -> bool {
        self.channels.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;
    use vocalink_core::RegistrationRequest;

    fn setup() -> (Arc<SessionRegistry>, SyncRelay, SessionId, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(SessionRegistry::new());
        let meta = registry.stage(RegistrationRequest::new("Mic", "10.0.0.2", None).unwrap());
        let (conn, session_rx) = Connection::new(8);
        registry.claim(&meta.id, conn).unwrap();
        let relay = SyncRelay::new(Arc::clone(&registry));
        (registry, relay, meta.id, session_rx)
    }

    #[test]
    fn witness_clock_is_monotonic() {
        let clock = WitnessClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn ping_round_trip() {
        let (_registry, relay, id, _srx) = setup();
        let (conn, mut rx) = Connection::new(8);
        relay.open(id.clone(), conn);

        let before = epoch_millis();
        let outcome = relay.handle_frame(&id, r#"{"t1":1000}"#);
        let SyncOutcome::Ponged(response) = outcome else {
            panic!("expected pong, got {outcome:?}");
        };
        assert_eq!(response.t1, 1000);
        assert!(response.t2 >= before);
        assert!(response.t3 >= response.t2);

        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "SYNC_RESPONSE");
        assert_eq!(json["t1"], 1000);
    }

    #[test]
    fn report_updates_metadata() {
        let (registry, relay, id, _srx) = setup();
        let (conn, _rx) = Connection::new(8);
        relay.open(id.clone(), conn);

        assert_eq!(
            relay.handle_frame(&id, r#"{"theta":5.2,"rtt":12.0}"#),
            SyncOutcome::Reported(true)
        );
        let meta = registry.get_metadata(&id).unwrap();
        assert_eq!(meta.theta, 5.2);
        assert_eq!(meta.last_rtt, 12.0);
        assert!(meta.last_sync.is_some());
    }

    #[test]
    fn trailing_report_after_terminate_is_ignored() {
        let (registry, relay, id, _srx) = setup();
        registry.terminate(&id);
        assert!(!relay.report(&id, 1.0, 2.0));
    }

    #[test]
    fn ping_without_channel_is_dropped() {
        let (_registry, relay, id, _srx) = setup();
        assert_eq!(relay.handle_frame(&id, r#"{"t1":1}"#), SyncOutcome::Dropped);
    }

    #[test]
    fn malformed_frame_gets_error_payload() {
        let (_registry, relay, id, _srx) = setup();
        let (conn, mut rx) = Connection::new(8);
        relay.open(id.clone(), conn);

        assert_eq!(
            relay.handle_frame(&id, r#"{"hello":true}"#),
            SyncOutcome::Rejected(ProtocolError::MalformedSync)
        );
        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("MALFORMED_SYNC"));
        assert!(relay.is_open(&id));
    }

    #[test]
    fn reopen_replaces_and_closes_previous() {
        let (_registry, relay, id, _srx) = setup();
        let (first, mut first_rx) = Connection::new(8);
        let (second, _second_rx) = Connection::new(8);
        let stale = relay.open(id.clone(), first);
        relay.open(id.clone(), second);

        assert_eq!(
            first_rx.try_recv().unwrap(),
            Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: REPLACED.into()
            }
        );
        assert!(!relay.release(&id, &stale));
        assert!(relay.is_open(&id));
        assert_eq!(relay.count(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let (_registry, relay, id, _srx) = setup();
        let (conn, _rx) = Connection::new(8);
        relay.open(id.clone(), conn);
        assert!(relay.close(&id));
        assert!(!relay.close(&id));
        assert!(!relay.is_open(&id));
    }

    #[test]
    fn broken_channel_is_removed_on_ping() {
        let (_registry, relay, id, _srx) = setup();
        let (conn, rx) = Connection::new(8);
        relay.open(id.clone(), conn);
        drop(rx);
        assert_eq!(relay.handle_frame(&id, r#"{"t1":5}"#), SyncOutcome::Dropped);
        assert!(!relay.is_open(&id));
    }
}
