//! Session registry with two-phase registration.
//!
//! A device first stages its metadata (HTTP request, id issued by the server),
//! then claims it by opening its persistent connection with that id. Staged and
//! active records live behind separate locks; a claim moves a record from one
//! to the other, so an id is claimed at most once.
//!
//! Locks only guard in-memory mutation. Sends use an [`Outbox`] copied out under
//! the lock and happen after it is released.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vocalink_core::session::epoch_millis;
use vocalink_core::{RecordingState, RegistrationRequest, SessionId, SessionMetadata, WsEvent};

use crate::connection::{Connection, Outbox, CLOSE_NORMAL};

/// Claim against an id that is not staged. The connection is handed back for rejection.
#[derive(Debug)]
pub struct NotStaged(pub Connection);

/// Outcome of a unicast send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No active session with that id; the message was dropped.
    Missing,
    /// The send failed and the session was terminated.
    Failed,
}

/// Outcome of a broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions whose send failed; already terminated when the report is returned.
    pub pruned: Vec<SessionId>,
}

struct ActiveSession {
    meta: SessionMetadata,
    connection: Connection,
}

#[derive(Default)]
pub struct SessionRegistry {
    // Entries leave only through `claim`. Unclaimed registrations are never
    // expired, so this grows with every staged-but-unclaimed request.
    staged: Mutex<HashMap<SessionId, SessionMetadata>>,
    // Ordered by id, which is ordered by stage time.
    active: RwLock<BTreeMap<SessionId, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh id for a device and park its metadata until it connects.
    pub fn stage(&self, request: RegistrationRequest) -> SessionMetadata {
        let meta = SessionMetadata::new(SessionId::new(), request);
        self.staged.lock().insert(meta.id.clone(), meta.clone());
        debug!(session_id = %meta.id, name = %meta.name, "session staged");
        meta
    }

    /// Atomically move a staged record into the active set, attaching its connection.
    pub fn claim(&self, id: &SessionId, connection: Connection) -> Result<SessionMetadata, NotStaged> {
        let Some(meta) = self.staged.lock().remove(id) else {
            return Err(NotStaged(connection));
        };
        let replaced = self.active.write().insert(
            id.clone(),
            ActiveSession {
                meta: meta.clone(),
                connection,
            },
        );
        if let Some(old) = replaced {
            warn!(session_id = %id, "claim replaced an active entry");
            old.connection.close(CLOSE_NORMAL, "");
        }
        info!(session_id = %id, name = %meta.name, "session active");
        Ok(meta)
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.active.read().contains_key(id)
    }

    pub fn is_staged(&self, id: &SessionId) -> bool {
        self.staged.lock().contains_key(id)
    }

    pub fn get_metadata(&self, id: &SessionId) -> Option<SessionMetadata> {
        self.active.read().get(id).map(|s| s.meta.clone())
    }

    pub fn list_metadata(&self) -> Vec<SessionMetadata> {
        self.active.read().values().map(|s| s.meta.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.active.read().len()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.lock().len()
    }

    fn outbox(&self, id: &SessionId) -> Option<Outbox> {
        self.active.read().get(id).map(|s| s.connection.outbox())
    }

    /// Send to one active session. Unknown ids are a silent no-op; a failed send terminates the session.
    pub fn send_to(&self, id: &SessionId, message: &str) -> Delivery {
        let Some(outbox) = self.outbox(id) else {
            debug!(session_id = %id, "dropping message for inactive session");
            return Delivery::Missing;
        };
        match outbox.send_text(message.to_string()) {
            Ok(()) => Delivery::Sent,
            Err(e) => {
                warn!(session_id = %id, error = %e, "send failed, terminating session");
                self.terminate(id);
                Delivery::Failed
            }
        }
    }

    pub fn send_event(&self, id: &SessionId, event: &WsEvent) -> Delivery {
        match event.encode() {
            Ok(json) => self.send_to(id, &json),
            Err(e) => {
                warn!(session_id = %id, error = %e, "failed to encode event");
                Delivery::Missing
            }
        }
    }

    /// Send to every session active at call time, then terminate the ones whose send failed.
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let recipients: Vec<(SessionId, Outbox)> = self
            .active
            .read()
            .iter()
            .map(|(id, s)| (id.clone(), s.connection.outbox()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, outbox) in recipients {
            match outbox.send_text(message.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "broadcast send failed");
                    report.pruned.push(id);
                }
            }
        }

        for id in &report.pruned {
            self.terminate(id);
        }
        debug!(delivered = report.delivered, pruned = report.pruned.len(), "broadcast complete");
        report
    }

    pub fn broadcast_event(&self, event: &WsEvent) -> BroadcastReport {
        match event.encode() {
            Ok(json) => self.broadcast(&json),
            Err(e) => {
                warn!(event = event.event_type(), error = %e, "failed to encode broadcast");
                BroadcastReport::default()
            }
        }
    }

    /// Remove an active session and close its connection. Returns the removed metadata; idempotent.
    pub fn terminate(&self, id: &SessionId) -> Option<SessionMetadata> {
        let removed = self.active.write().remove(id)?;
        removed.connection.close(CLOSE_NORMAL, "");
        info!(session_id = %id, "session terminated");
        Some(removed.meta)
    }

    /// Store a device-reported clock offset. Ignored if the session is no longer active.
    pub fn update_sync(&self, id: &SessionId, theta: f64, rtt: f64) -> bool {
        let mut active = self.active.write();
        let Some(session) = active.get_mut(id) else {
            return false;
        };
        session.meta.record_sync(theta, rtt, epoch_millis());
        true
    }

    /// Store the last reported recording state. Returns `false` if the session is not active.
    pub fn set_recording_state(&self, id: &SessionId, state: RecordingState) -> bool {
        let mut active = self.active.write();
        let Some(session) = active.get_mut(id) else {
            return false;
        };
        session.meta.state = state;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;

    fn request(name: &str) -> RegistrationRequest {
        RegistrationRequest::new(name, "10.0.0.2", Some(50)).unwrap()
    }

    fn claim_new(registry: &SessionRegistry, name: &str) -> (SessionId, mpsc::Receiver<Outbound>) {
        let meta = registry.stage(request(name));
        let (conn, rx) = Connection::new(16);
        registry.claim(&meta.id, conn).unwrap();
        (meta.id, rx)
    }

    fn texts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(t) = frame {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn stage_resets_application_fields() {
        let registry = SessionRegistry::new();
        let meta = registry.stage(request("Mic"));
        assert_eq!(meta.state, RecordingState::Idle);
        assert_eq!(meta.theta, 0.0);
        assert!(meta.last_sync.is_none());
        assert!(registry.is_staged(&meta.id));
        assert!(!registry.is_active(&meta.id));
    }

    #[test]
    fn stage_issues_unique_ids() {
        let registry = SessionRegistry::new();
        let a = registry.stage(request("a"));
        let b = registry.stage(request("a"));
        assert_ne!(a.id, b.id);
        assert_eq!(registry.staged_count(), 2);
    }

    #[test]
    fn claim_moves_staged_to_active() {
        let registry = SessionRegistry::new();
        let meta = registry.stage(request("Mic"));
        let (conn, _rx) = Connection::new(4);
        let claimed = registry.claim(&meta.id, conn).unwrap();
        assert_eq!(claimed, meta);
        assert!(registry.is_active(&meta.id));
        assert!(!registry.is_staged(&meta.id));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn staged_entries_leave_only_by_claim() {
        let registry = SessionRegistry::new();
        let kept = registry.stage(request("Mic"));
        let claimed = registry.stage(request("Mic 2"));
        assert_eq!(registry.staged_count(), 2);

        let (conn, _rx) = Connection::new(4);
        registry.claim(&claimed.id, conn).unwrap();
        registry.terminate(&kept.id);
        assert_eq!(registry.staged_count(), 1);
        assert!(registry.is_staged(&kept.id));
        assert!(!registry.is_staged(&claimed.id));
    }

    #[test]
    fn second_claim_is_rejected() {
        let registry = SessionRegistry::new();
        let meta = registry.stage(request("Mic"));
        let (first, _rx1) = Connection::new(4);
        let (second, _rx2) = Connection::new(4);
        assert!(registry.claim(&meta.id, first).is_ok());
        let NotStaged(returned) = registry.claim(&meta.id, second).unwrap_err();
        assert!(!returned.is_closed());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unknown_id_claim_leaves_active_set_untouched() {
        let registry = SessionRegistry::new();
        let (_id, _rx) = claim_new(&registry, "existing");
        let (conn, _rx2) = Connection::new(4);
        assert!(registry.claim(&SessionId::from_raw("sess_bogus"), conn).is_err());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn concurrent_claims_succeed_once() {
        let registry = std::sync::Arc::new(SessionRegistry::new());
        let meta = registry.stage(request("Mic"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = std::sync::Arc::clone(&registry);
                let id = meta.id.clone();
                std::thread::spawn(move || {
                    let (conn, rx) = Connection::new(4);
                    let ok = registry.claim(&id, conn).is_ok();
                    (ok, rx)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(ok, _)| *ok).count(), 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn send_to_unknown_is_silent() {
        let registry = SessionRegistry::new();
        let (_id, mut rx) = claim_new(&registry, "Mic");
        assert_eq!(registry.send_to(&SessionId::from_raw("sess_nope"), "hi"), Delivery::Missing);
        assert_eq!(registry.count(), 1);
        assert!(texts(&mut rx).is_empty());
    }

    #[test]
    fn send_to_active_session() {
        let registry = SessionRegistry::new();
        let (id, mut rx) = claim_new(&registry, "Mic");
        assert_eq!(registry.send_to(&id, "hi"), Delivery::Sent);
        assert_eq!(texts(&mut rx), vec!["hi".to_string()]);
    }

    #[test]
    fn failed_unicast_terminates() {
        let registry = SessionRegistry::new();
        let (id, rx) = claim_new(&registry, "Mic");
        drop(rx);
        assert_eq!(registry.send_to(&id, "hi"), Delivery::Failed);
        assert!(!registry.is_active(&id));
    }

    #[test]
    fn broadcast_skips_and_prunes_broken_connection() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = claim_new(&registry, "a");
        let (b, rx_b) = claim_new(&registry, "b");
        let (c, mut rx_c) = claim_new(&registry, "c");
        drop(rx_b);

        let report = registry.broadcast("go");

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![b.clone()]);
        assert_eq!(texts(&mut rx_a), vec!["go".to_string()]);
        assert_eq!(texts(&mut rx_c), vec!["go".to_string()]);
        assert!(registry.is_active(&a));
        assert!(registry.is_active(&c));
        assert!(!registry.is_active(&b));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn broadcast_to_empty_registry() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.broadcast("x"), BroadcastReport::default());
    }

    #[test]
    fn staged_sessions_do_not_receive_broadcasts() {
        let registry = SessionRegistry::new();
        registry.stage(request("waiting"));
        let (_id, mut rx) = claim_new(&registry, "live");
        let report = registry.broadcast("x");
        assert_eq!(report.delivered, 1);
        assert_eq!(texts(&mut rx).len(), 1);
    }

    #[test]
    fn terminate_is_idempotent_and_closes() {
        let registry = SessionRegistry::new();
        let (id, mut rx) = claim_new(&registry, "Mic");
        assert!(registry.terminate(&id).is_some());
        assert!(registry.terminate(&id).is_none());
        assert_eq!(registry.count(), 0);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: CLOSE_NORMAL, .. }));
    }

    #[test]
    fn update_sync_records_values() {
        let registry = SessionRegistry::new();
        let (id, _rx) = claim_new(&registry, "Mic");
        assert!(registry.update_sync(&id, 5.2, 12.0));
        let meta = registry.get_metadata(&id).unwrap();
        assert_eq!(meta.theta, 5.2);
        assert_eq!(meta.last_rtt, 12.0);
        assert!(meta.last_sync.is_some());
    }

    #[test]
    fn update_sync_after_terminate_is_ignored() {
        let registry = SessionRegistry::new();
        let (id, _rx) = claim_new(&registry, "Mic");
        registry.terminate(&id);
        assert!(!registry.update_sync(&id, 1.0, 1.0));
        assert!(registry.get_metadata(&id).is_none());
    }

    #[test]
    fn recording_state_setter() {
        let registry = SessionRegistry::new();
        let (id, _rx) = claim_new(&registry, "Mic");
        assert!(registry.set_recording_state(&id, RecordingState::Recording));
        assert_eq!(registry.get_metadata(&id).unwrap().state, RecordingState::Recording);
        assert!(!registry.set_recording_state(&SessionId::new(), RecordingState::Error));
    }

    #[test]
    fn list_metadata_is_ordered_by_stage_time() {
        let registry = SessionRegistry::new();
        let (a, _ra) = claim_new(&registry, "a");
        let (b, _rb) = claim_new(&registry, "b");
        let (c, _rc) = claim_new(&registry, "c");
        let ids: Vec<_> = registry.list_metadata().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }
}
