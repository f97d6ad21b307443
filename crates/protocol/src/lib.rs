//! Athena Protocol
//!
//! Shared types for communication between the Athena server and the hook
//! clients embedded in the coding-agent harness. Envelopes are serialized
//! as newline-delimited JSON over a Unix domain socket.

use uuid::Uuid;

// Re-exports
pub mod envelope;
pub mod feed;
pub mod rules;
pub mod runtime;

pub use envelope::*;
pub use feed::*;
pub use rules::*;
pub use runtime::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
