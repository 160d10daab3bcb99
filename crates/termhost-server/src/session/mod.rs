//! Session management: PTY lifecycle, bounded output, inactivity reclamation,
//! event fan-out.

pub mod events;
pub mod manager;
pub mod output_buffer;
pub mod pty;
pub mod supervisor;

pub use manager::{SessionConfig, SessionManager};
