//! Lifecycle notifications fanned out to transport subscribers.

use serde::{Deserialize, Serialize};

/// An occurrence on one managed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The process produced a chunk of output.
    Output { execution_id: String, data: String },
    /// The process terminated.
    Exited {
        execution_id: String,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl SessionEvent {
    /// Identifier of the session this event belongs to.
    pub fn execution_id(&self) -> &str {
        match self {
            SessionEvent::Output { execution_id, .. } => execution_id,
            SessionEvent::Exited { execution_id, .. } => execution_id,
        }
    }
}
