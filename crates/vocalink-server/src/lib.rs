//! Session coordination server: registry, dashboard slot, clock-sync relay,
//! discovery advertisement, and the axum transport that drives them.

pub mod connection;
pub mod coordinator;
pub mod dashboard;
pub mod discovery;
pub mod identity;
pub mod registry;
pub mod server;
pub mod settings;
pub mod socket;
pub mod sync;

pub use coordinator::{Coordinator, CoordinatorError, Dispatch, ServerIdentity};
pub use discovery::{DiscoveryError, MdnsAdvertiser, NoopAdvertiser, ServiceAdvertiser};
pub use server::{bind, serve, start, ServerConfig, ServerHandle};
pub use settings::{load_settings, load_settings_from_path, IgnoredOverride, LoadedSettings, Settings, SettingsError};
