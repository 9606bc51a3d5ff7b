//! Request correlator: routes responses read off the wire to the caller that
//! sent the matching request.

use crate::error::McpError;
use crate::jsonrpc::{JsonRpcResponse, RequestId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// What a parked caller eventually receives.
#[derive(Debug)]
pub enum Outcome {
    Response(JsonRpcResponse),
    /// The request was abandoned by shutdown or process exit.
    Cancelled(McpError),
}

/// Receiving half of a registered request.
pub type ResponseSlot = oneshot::Receiver<Outcome>;

/// Table of outstanding requests, keyed by normalized id.
#[derive(Debug, Default)]
pub struct Correlator {
    slots: Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a caller under `id`. An id that is still outstanding cannot be
    /// registered twice.
    pub fn register(&self, id: RequestId) -> Result<ResponseSlot, McpError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(&id) {
            return Err(McpError::Protocol(format!(
                "request id {id} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a response to its caller. Returns `false` (after logging) when
    /// nobody is waiting for this id: late, duplicate, or unsolicited replies.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let slot = self.slots.lock().unwrap().remove(&response.id);
        match slot {
            Some(tx) => {
                let id = response.id.clone();
                if tx.send(Outcome::Response(response)).is_err() {
                    tracing::debug!(%id, "Caller gave up before its response arrived");
                }
                true
            }
            None => {
                tracing::warn!(id = %response.id, "Dropping response with no pending request");
                false
            }
        }
    }

    /// Remove the slot of a caller that stopped waiting. No-op if the response
    /// already claimed it.
    pub fn forget(&self, id: &RequestId) -> bool {
        self.slots.lock().unwrap().remove(id).is_some()
    }

    /// Fail every outstanding request with `reason` and empty the table.
    pub fn cancel_all(&self, reason: McpError) -> usize {
        let drained: Vec<_> = self.slots.lock().unwrap().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Outcome::Cancelled(reason.clone()));
        }
        if count > 0 {
            tracing::debug!("Cancelled {count} pending request(s): {reason}");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Removes a pending entry when a waiting caller leaves, whichever way it
/// leaves (response, timeout, shutdown, or its future being dropped).
pub(crate) struct PendingGuard<'a> {
    pub(crate) correlator: &'a Correlator,
    pub(crate) id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(&self.id);
    }
}
