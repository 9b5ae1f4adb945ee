//! Composition root for session coordination.
//!
//! One [`Coordinator`] is built at startup and shared with every handler via
//! `Arc`. It owns the server identity, the advertiser, and the session,
//! dashboard, and sync components, and keeps them consistent with each other:
//! a pruned session also loses its sync channel and the dashboard hears about it.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info, warn};
use vocalink_core::session::validate_name;
use vocalink_core::{
    Command, CommandTarget, ConnectionId, ProtocolError, RecordingState, RegistrationRequest,
    ServerInfo, SessionId, SessionMetadata, ValidationError, WsEvent,
};

use crate::connection::{Connection, CLOSE_POLICY_VIOLATION};
use crate::dashboard::{DashboardChannel, DashboardConnect};
use crate::discovery::{DiscoveryError, DiscoveryRecord, ServiceAdvertiser};
use crate::registry::{BroadcastReport, Delivery, NotStaged, SessionRegistry};
use crate::sync::{SyncOutcome, SyncRelay};

pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::SessionNotFound(_) => SESSION_NOT_FOUND,
            Self::Discovery(_) => "DISCOVERY_FAILED",
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        json!({
            "error": self.code(),
            "message": self.to_string(),
        })
    }
}

/// Name, address and port the server is known by. Only the name changes after startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// Result of routing one dashboard message.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Broadcast(BroadcastReport),
    Unicast { session_id: SessionId, delivery: Delivery },
    Rejected(ProtocolError),
}

pub struct Coordinator {
    identity: RwLock<ServerIdentity>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    // Record currently published; also serializes rename, start and shutdown.
    advertised: Mutex<Option<DiscoveryRecord>>,
    registry: Arc<SessionRegistry>,
    dashboard: DashboardChannel,
    sync: SyncRelay,
}

impl Coordinator {
    pub fn new(identity: ServerIdentity, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            identity: RwLock::new(identity),
            advertiser,
            advertised: Mutex::new(None),
            sync: SyncRelay::new(Arc::clone(&registry)),
            registry,
            dashboard: DashboardChannel::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn dashboard(&self) -> &DashboardChannel {
        &self.dashboard
    }

    pub fn sync(&self) -> &SyncRelay {
        &self.sync
    }

    pub fn identity(&self) -> ServerIdentity {
        self.identity.read().clone()
    }

    pub fn server_info(&self) -> ServerInfo {
        let identity = self.identity.read();
        ServerInfo {
            name: identity.name.clone(),
            ip: identity.ip.clone(),
            session_count: self.registry.count(),
        }
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn stage_session(&self, request: RegistrationRequest) -> SessionMetadata {
        self.registry.stage(request)
    }

    /// Promote a staged session. The device gets `session_init`, the dashboard `session_registered`.
    /// An unknown id closes the connection with a policy violation.
    pub fn claim_session(&self, id: &SessionId, connection: Connection) -> Result<SessionMetadata, CoordinatorError> {
        let meta = match self.registry.claim(id, connection) {
            Ok(meta) => meta,
            Err(NotStaged(connection)) => {
                warn!(session_id = %id, "claim for unknown session, rejecting");
                connection.close(CLOSE_POLICY_VIOLATION, SESSION_NOT_FOUND);
                return Err(CoordinatorError::SessionNotFound(id.clone()));
            }
        };

        // A failed init send has already terminated the session; the dashboard never saw it.
        if self.registry.send_event(id, &WsEvent::SessionInit(meta.clone())) == Delivery::Failed {
            return Err(CoordinatorError::SessionNotFound(id.clone()));
        }
        self.dashboard.notify(&WsEvent::SessionRegistered(meta.clone()));
        Ok(meta)
    }

    /// Tear down a session whose connection ended. Returns whether it was active.
    pub fn end_session(&self, id: &SessionId) -> bool {
        let removed = self.registry.terminate(id).is_some();
        self.sync.close(id);
        if removed {
            self.dashboard.notify(&WsEvent::SessionUnregistered { session_id: id.clone() });
        }
        removed
    }

    /// Relay an action message from a device to the dashboard. Unparseable frames are dropped.
    pub fn handle_session_message(&self, id: &SessionId, raw: &str) -> bool {
        let command = match Command::parse_from_session(raw, id) {
            Ok(command) => command,
            Err(e) => {
                debug!(session_id = %id, error = %e, "ignoring session message");
                return false;
            }
        };
        self.dashboard.notify(&WsEvent::SessionAction {
            session_id: id.clone(),
            action: command.action(),
            trigger_time: command.trigger_time(),
        })
    }

    /// Store a reported recording state and tell the dashboard. Any transition is accepted.
    pub fn set_recording_state(&self, id: &SessionId, state: RecordingState) -> Result<(), CoordinatorError> {
        if !self.registry.set_recording_state(id, state) {
            return Err(CoordinatorError::SessionNotFound(id.clone()));
        }
        debug!(session_id = %id, state = state.as_str(), "recording state updated");
        self.dashboard.notify(&WsEvent::SessionState {
            session_id: id.clone(),
            state,
        });
        Ok(())
    }

    // Sessions removed by a failed send lose their sync channel and are announced as gone.
    fn forget_pruned(&self, pruned: &[SessionId]) {
        for id in pruned {
            self.sync.close(id);
            self.dashboard.notify(&WsEvent::SessionUnregistered { session_id: id.clone() });
        }
    }

    // ── Dashboard ───────────────────────────────────────────────────────

    /// Occupy the dashboard slot and push one `session_registered` per active session.
    ///
    /// A session that ends while the snapshot is being sent may have its
    /// `session_unregistered` overtaken by the snapshot entry, so each entry is
    /// re-checked after it is pushed and retracted if the session is gone.
    pub fn connect_dashboard(&self, connection: Connection) -> DashboardConnect {
        let outcome = self.dashboard.connect(connection);
        if matches!(outcome, DashboardConnect::Accepted(_)) {
            let snapshot = self.registry.list_metadata();
            debug!(sessions = snapshot.len(), "sending dashboard snapshot");
            for meta in snapshot {
                let session_id = meta.id.clone();
                if !self.dashboard.notify(&WsEvent::SessionRegistered(meta)) {
                    break;
                }
                if !self.registry.is_active(&session_id)
                    && !self.dashboard.notify(&WsEvent::SessionUnregistered { session_id })
                {
                    break;
                }
            }
        }
        outcome
    }

    pub fn release_dashboard(&self, token: &ConnectionId) -> bool {
        self.dashboard.release(token)
    }

    /// Parse and route one dashboard command. Protocol errors are answered on the dashboard channel.
    pub fn handle_dashboard_message(&self, raw: &str) -> Dispatch {
        match Command::parse(raw) {
            Ok(command) => self.dispatch(&command),
            Err(e) => {
                debug!(code = e.code(), error = %e, "rejecting dashboard message");
                self.dashboard.send_json(&e.to_payload());
                Dispatch::Rejected(e)
            }
        }
    }

    /// Fan a command out: `*_all` to every active session, `*_one` to its target.
    pub fn dispatch(&self, command: &Command) -> Dispatch {
        let wire = command.to_wire().to_string();
        let action = command.action().as_str();
        match command.target() {
            CommandTarget::All => {
                let report = self.registry.broadcast(&wire);
                info!(action, recipients = report.delivered, pruned = report.pruned.len(), "command broadcast");
                self.forget_pruned(&report.pruned);
                Dispatch::Broadcast(report)
            }
            CommandTarget::One(id) => {
                let delivery = self.registry.send_to(id, &wire);
                info!(action, session_id = %id, ?delivery, "command sent");
                if delivery == Delivery::Failed {
                    self.forget_pruned(std::slice::from_ref(id));
                }
                Dispatch::Unicast {
                    session_id: id.clone(),
                    delivery,
                }
            }
        }
    }

    // ── Sync ────────────────────────────────────────────────────────────

    /// Attach a sync channel to an active session. Returns the token for [`Coordinator::close_sync`].
    pub fn open_sync(&self, id: &SessionId, connection: Connection) -> Result<ConnectionId, CoordinatorError> {
        if !self.registry.is_active(id) {
            warn!(session_id = %id, "sync channel for inactive session, rejecting");
            connection.close(CLOSE_POLICY_VIOLATION, SESSION_NOT_FOUND);
            return Err(CoordinatorError::SessionNotFound(id.clone()));
        }
        let token = self.sync.open(id.clone(), connection);
        // The session may have ended between the check and the insert.
        if !self.registry.is_active(id) {
            self.sync.release(id, &token);
            return Err(CoordinatorError::SessionNotFound(id.clone()));
        }
        Ok(token)
    }

    pub fn handle_sync_message(&self, id: &SessionId, raw: &str) -> SyncOutcome {
        self.sync.handle_frame(id, raw)
    }

    /// Close the sync channel if `token` still owns it.
    pub fn close_sync(&self, id: &SessionId, token: &ConnectionId) -> bool {
        self.sync.release(id, token)
    }

    // ── Identity and discovery ──────────────────────────────────────────

    fn current_record(&self) -> DiscoveryRecord {
        let identity = self.identity.read();
        DiscoveryRecord::new(identity.name.clone(), identity.ip.clone(), identity.port)
    }

    /// Publish the discovery record. Failure is logged and returned; serving continues either way.
    pub fn start_advertising(&self) -> Result<(), CoordinatorError> {
        let mut advertised = self.advertised.lock();
        let record = self.current_record();
        match self.advertiser.register(&record) {
            Ok(()) => {
                info!(name = %record.name, ip = %record.ip, port = record.port, "advertising service");
                *advertised = Some(record);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "service advertisement failed");
                Err(e.into())
            }
        }
    }

    /// Rename the server, re-publish discovery, and tell every active session.
    pub fn rename(&self, name: &str) -> Result<ServerInfo, CoordinatorError> {
        let name = validate_name(name)?;
        {
            let mut advertised = self.advertised.lock();
            let old_name = std::mem::replace(&mut self.identity.write().name, name.clone());
            info!(old = %old_name, new = %name, "server renamed");

            if let Some(old) = advertised.take() {
                if let Err(e) = self.advertiser.unregister(&old) {
                    warn!(error = %e, "failed to withdraw old service record");
                }
            }
            let record = self.current_record();
            match self.advertiser.register(&record) {
                Ok(()) => *advertised = Some(record),
                Err(e) => warn!(error = %e, "failed to publish renamed service record"),
            }
        }

        let report = self.registry.broadcast_event(&WsEvent::DashboardRename(name));
        self.forget_pruned(&report.pruned);
        Ok(self.server_info())
    }

    /// Withdraw the discovery record and release advertiser resources. Sessions are left to the transport.
    pub fn shutdown(&self) {
        let mut advertised = self.advertised.lock();
        if let Some(record) = advertised.take() {
            if let Err(e) = self.advertiser.unregister(&record) {
                warn!(error = %e, "failed to withdraw service record");
            }
        }
        if let Err(e) = self.advertiser.shutdown() {
            warn!(error = %e, "advertiser shutdown failed");
        }
        info!("coordinator shut down");
    }
}
