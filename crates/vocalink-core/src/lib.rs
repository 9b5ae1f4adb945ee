pub mod commands;
pub mod errors;
pub mod events;
pub mod ids;
pub mod session;
pub mod sync;

pub use commands::{Action, Command, CommandTarget};
pub use errors::{ConnectionError, ProtocolError, ValidationError};
pub use events::WsEvent;
pub use ids::{ConnectionId, SessionId};
pub use session::{RecordingState, RegistrationRequest, ServerInfo, SessionMetadata};
pub use sync::{SyncFrame, SyncReport, SyncRequest, SyncResponse};
