//! termhost-core: shared types for the terminal session host.
//!
//! Provides the error taxonomy, session lifecycle events, the session
//! metadata projection, and the JSON wire protocol used by the gateway.

pub mod error;
pub mod event;
pub mod protocol;
pub mod session;

// Re-export commonly used items at crate root.
pub use error::{TermError, TermResult};
pub use event::SessionEvent;
pub use protocol::{decode_client, encode_server, ClientMessage, Request, Response, ServerMessage};
pub use session::{SessionInfo, SpawnRequest};
