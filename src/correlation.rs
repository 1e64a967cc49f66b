//! Correlation-id bookkeeping for ORM requests sent to a peer, so the
//! matching [`OrmResponse`] can be routed back to the waiting caller
//! regardless of arrival order or interleaving with other traffic.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::orm::bridge::OrmResponse;

/// Tracks in-flight ORM requests by correlation id. One table per process;
/// shared between the [`crate::runner`] dispatch loop (which resolves
/// entries as responses arrive) and the `OrmTransport` implementation that
/// sends the request and awaits the match.
#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<OrmResponse>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id`'s response before the request is sent, to
    /// close the race between send and an immediate reply.
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<OrmResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("correlation table lock poisoned").insert(id, tx);
        rx
    }

    /// Deliver an inbound response to its waiter, if still registered.
    /// Returns `false` if no one was waiting (already retired, or an
    /// unmatched/duplicate response from a misbehaving peer).
    pub fn resolve(&self, response: OrmResponse) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("correlation table lock poisoned")
            .remove(&response.correlation_id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop a registration without waiting for a response, e.g. after a
    /// timeout. Idempotent.
    pub fn retire(&self, id: Uuid) {
        self.pending.lock().expect("correlation table lock poisoned").remove(&id);
    }
}
