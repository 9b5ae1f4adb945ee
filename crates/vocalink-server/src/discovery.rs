//! Local-network service advertisement.
//!
//! [`ServiceAdvertiser`] publishes one record `{name, ip, port}` under
//! [`SERVICE_TYPE`]. Failures are reported to the caller, which logs and
//! carries on: discovery never gates session coordination.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::debug;

pub const SERVICE_TYPE: &str = "_vocalink._tcp.local.";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mdns daemon error: {0}")]
    Daemon(String),
    #[error("invalid discovery record: {0}")]
    InvalidRecord(String),
}

/// The advertised tuple. Re-published in full on every rename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub service_type: &'static str,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl DiscoveryRecord {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            service_type: SERVICE_TYPE,
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// `<instance>.<service type>`, the key mDNS unregisters by.
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.name, self.service_type)
    }

    /// Host label derived from the name: ASCII alphanumerics and dashes only.
    pub fn host_name(&self) -> String {
        let mut label: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        label = label.trim_matches('-').to_string();
        if label.is_empty() {
            label.push_str("vocalink");
        }
        format!("{label}.local.")
    }

    fn properties(&self) -> HashMap<String, String> {
        HashMap::from([
            ("service".to_string(), "vocalink".to_string()),
            ("name".to_string(), self.name.clone()),
        ])
    }
}

pub trait ServiceAdvertiser: Send + Sync {
    fn register(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError>;
    /// Withdraw a record. Withdrawing one that was never registered is not an error.
    fn unregister(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError>;
    fn shutdown(&self) -> Result<(), DiscoveryError>;
}

/// Advertiser backed by the `mdns-sd` responder daemon.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        Ok(Self { daemon })
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn register(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        let info = ServiceInfo::new(
            record.service_type,
            &record.name,
            &record.host_name(),
            record.ip.as_str(),
            record.port,
            record.properties(),
        )
        .map_err(|e| DiscoveryError::InvalidRecord(e.to_string()))?;
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        debug!(fullname = %record.fullname(), ip = %record.ip, port = record.port, "mdns record registered");
        Ok(())
    }

    fn unregister(&self, record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        // The daemon reports a missing record asynchronously on the returned
        // receiver, which is dropped here.
        self.daemon
            .unregister(&record.fullname())
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        debug!(fullname = %record.fullname(), "mdns record unregistered");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        self.daemon
            .shutdown()
            .map(|_| ())
            .map_err(|e| DiscoveryError::Daemon(e.to_string()))
    }
}

/// Advertiser that does nothing. Used with `--no-advertise`.
#[derive(Debug, Default)]
pub struct NoopAdvertiser;

impl ServiceAdvertiser for NoopAdvertiser {
    fn register(&self, _record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn unregister(&self, _record: &DiscoveryRecord) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}
