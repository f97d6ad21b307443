//! Wire envelopes exchanged over the hook socket.
//!
//! Each client connection carries exactly one `hook_event` envelope
//! (client → server) and receives at most one `hook_result` envelope
//! (server → client) before the connection closes. Malformed envelopes are
//! dropped without a reply; the client enforces its own timeout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol version. A mismatch rejects the envelope outright.
pub const PROTOCOL_VERSION: u32 = 1;

/// The only inbound envelope kind this server accepts.
pub const KIND_HOOK_EVENT: &str = "hook_event";

/// Inbound envelope: one lifecycle hook notification from the harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEventEnvelope {
    pub version: u32,
    pub kind: String,
    pub request_id: String,
    pub ts: String,
    pub session_id: String,
    pub hook_event_name: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outbound envelope resolving a pending hook request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResultEnvelope {
    pub request_id: String,
    pub ts: String,
    pub payload: HookResultPayload,
}

/// How the harness should proceed with the intercepted hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResultPayload {
    pub action: HookAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_json: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Passthrough,
    BlockWithStderr,
    JsonOutput,
}

/// Why an inbound line was rejected. Rejected envelopes get no reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    Malformed,
    WrongKind(String),
    VersionMismatch(u32),
    MissingRequestId,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Malformed => write!(f, "unparseable envelope"),
            EnvelopeError::WrongKind(kind) => write!(f, "unexpected envelope kind {kind:?}"),
            EnvelopeError::VersionMismatch(v) => {
                write!(f, "protocol version {v} (expected {PROTOCOL_VERSION})")
            }
            EnvelopeError::MissingRequestId => write!(f, "missing or empty request_id"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Decode and validate one wire line into a hook event envelope.
pub fn decode_hook_event(line: &str) -> Result<HookEventEnvelope, EnvelopeError> {
    let envelope: HookEventEnvelope =
        serde_json::from_str(line.trim()).map_err(|_| EnvelopeError::Malformed)?;

    if envelope.kind != KIND_HOOK_EVENT {
        return Err(EnvelopeError::WrongKind(envelope.kind));
    }
    if envelope.version != PROTOCOL_VERSION {
        return Err(EnvelopeError::VersionMismatch(envelope.version));
    }
    if envelope.request_id.trim().is_empty() {
        return Err(EnvelopeError::MissingRequestId);
    }

    Ok(envelope)
}
