//! Unix-domain-socket transport for hook events.
//!
//! Each client connection carries exactly one newline-delimited JSON
//! `hook_event` envelope. Valid envelopes become runtime events and the
//! connection parks until a decision is routed back for that request id;
//! malformed envelopes are dropped with no reply and the remote client's
//! own timeout passes the hook through. The server never arms timers;
//! timeout enforcement is deliberately the client's job.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use athena_protocol::{
    decode_hook_event, HookAction, HookResultEnvelope, HookResultPayload, RuntimeDecision,
    RuntimeEvent,
};

use crate::time::now_iso8601;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How a parked connection gets resolved.
#[derive(Debug)]
pub enum RouterReply {
    Decision(RuntimeDecision),
    /// Default empty passthrough for requests nobody claimed.
    Passthrough,
}

/// Registry of connections parked on their request id.
///
/// Cheap to clone; the pipeline keeps one side, each connection task the
/// other. Dropping a pending sender closes the connection silently and the
/// remote client falls back to its timeout.
#[derive(Clone, Default)]
pub struct DecisionRouter {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<RouterReply>>>>,
}

impl DecisionRouter {
    pub fn new() -> Self {
        DecisionRouter::default()
    }

    /// Park a request id, returning the receiver its connection waits on.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<RouterReply> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .pending
            .lock()
            .expect("router lock poisoned")
            .insert(request_id.to_string(), tx);
        if previous.is_some() {
            warn!(
                component = "transport",
                event = "transport.request_id_reused",
                request_id = request_id,
                "Duplicate request id, abandoning earlier connection"
            );
        }
        rx
    }

    fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("router lock poisoned")
            .remove(request_id);
    }

    /// Resolve a parked request with an explicit decision.
    pub fn send_decision(&self, request_id: &str, decision: RuntimeDecision) -> bool {
        self.reply(request_id, RouterReply::Decision(decision))
    }

    /// Resolve a parked request with the default passthrough.
    pub fn release(&self, request_id: &str) -> bool {
        self.reply(request_id, RouterReply::Passthrough)
    }

    /// Drop every parked connection (session teardown).
    pub fn abandon_all(&self) {
        self.pending.lock().expect("router lock poisoned").clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("router lock poisoned").len()
    }

    fn reply(&self, request_id: &str, reply: RouterReply) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("router lock poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// The per-instance hook socket server.
pub struct HookSocket {
    listener: UnixListener,
    router: DecisionRouter,
    events_tx: mpsc::Sender<RuntimeEvent>,
}

impl HookSocket {
    /// Bind the socket, replacing any stale file from a dead process.
    pub fn bind(
        path: &Path,
        router: DecisionRouter,
        events_tx: mpsc::Sender<RuntimeEvent>,
    ) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(
            component = "transport",
            event = "transport.listening",
            socket = %path.display(),
            "Hook socket bound"
        );
        Ok(HookSocket {
            listener,
            router,
            events_tx,
        })
    }

    /// Accept connections until the process shuts down.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    let router = self.router.clone();
                    let events_tx = self.events_tx.clone();
                    tokio::spawn(handle_connection(stream, conn_id, router, events_tx));
                }
                Err(error) => {
                    warn!(
                        component = "transport",
                        event = "transport.accept_failed",
                        error = %error,
                        "Accept failed"
                    );
                }
            }
        }
    }
}

/// Read one envelope, park until a decision, write one result.
async fn handle_connection(
    stream: UnixStream,
    conn_id: u64,
    router: DecisionRouter,
    events_tx: mpsc::Sender<RuntimeEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => return,
        Ok(_) => {}
    }

    let envelope = match decode_hook_event(&line) {
        Ok(envelope) => envelope,
        Err(error) => {
            // No reply: the client times out and passes its hook through.
            debug!(
                component = "transport",
                event = "transport.envelope_dropped",
                connection_id = conn_id,
                error = %error,
                "Dropped malformed envelope"
            );
            return;
        }
    };

    let request_id = envelope.request_id.clone();
    let event = RuntimeEvent::from_envelope(envelope);
    debug!(
        component = "transport",
        event = "transport.hook_received",
        connection_id = conn_id,
        request_id = %request_id,
        hook_name = %event.hook_name,
        "Hook event received"
    );

    let reply_rx = router.register(&request_id);
    if events_tx.send(event).await.is_err() {
        router.forget(&request_id);
        return;
    }

    // Parked until the pipeline resolves this request id. No timer here.
    let reply = match reply_rx.await {
        Ok(reply) => reply,
        Err(_) => return,
    };

    let payload = match reply {
        RouterReply::Decision(decision) => decision.to_result_payload(),
        RouterReply::Passthrough => HookResultPayload {
            action: HookAction::Passthrough,
            stderr: None,
            stdout_json: None,
        },
    };
    let result = HookResultEnvelope {
        request_id: request_id.clone(),
        ts: now_iso8601(),
        payload,
    };

    let mut json = match serde_json::to_string(&result) {
        Ok(json) => json,
        Err(error) => {
            warn!(
                component = "transport",
                event = "transport.result_serialize_failed",
                request_id = %request_id,
                error = %error,
                "Failed to serialize hook result"
            );
            return;
        }
    };
    json.push('\n');

    if write_half.write_all(json.as_bytes()).await.is_err() {
        debug!(
            component = "transport",
            event = "transport.client_gone",
            connection_id = conn_id,
            "Client disconnected before the result was written"
        );
    }
    let _ = write_half.shutdown().await;
}
