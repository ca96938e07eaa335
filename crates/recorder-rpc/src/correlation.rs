//! Correlation table: in-flight requests awaiting a response.
//!
//! Responses may arrive in any order. Settlement is by id only; an id with no
//! entry is an orphan and is logged and dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{RequestId, Response};
use crate::error::RpcError;

pub type Reply = Result<Option<Value>, RpcError>;

/// Awaitable result of a request. Resolves once the matching response arrives.
///
/// Dropping it abandons the wait; the entry is settled (into the void) when the
/// response eventually arrives.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(RpcError::Closed)))
    }
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<RequestId, oneshot::Sender<Reply>>,
    closed: AtomicBool,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_id() -> RequestId {
        RequestId::generate()
    }

    /// Allocate a pending entry for `id`.
    ///
    /// Fails with `EngineExited` once the table has been closed, and with a
    /// protocol error if `id` is already in flight.
    pub fn register(&self, id: RequestId) -> Result<PendingReply, RpcError> {
        if self.is_closed() {
            return Err(RpcError::EngineExited);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(RpcError::Protocol(format!("duplicate request id {}", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // close() may have drained between the check and the insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(RpcError::EngineExited);
        }

        Ok(PendingReply { id, rx })
    }

    pub fn resolve(&self, id: &RequestId, value: Option<Value>) -> bool {
        self.settle_with(id, Ok(value))
    }

    pub fn reject(&self, id: &RequestId, error: RpcError) -> bool {
        self.settle_with(id, Err(error))
    }

    /// Route a response to its entry. Non-200 statuses reject with the payload verbatim.
    pub fn settle(&self, response: Response) -> bool {
        if response.is_success() {
            self.resolve(&response.id, response.result)
        } else {
            let error = RpcError::Remote {
                status: response.status,
                payload: response.error.unwrap_or(Value::Null),
            };
            self.reject(&response.id, error)
        }
    }

    fn settle_with(&self, id: &RequestId, reply: Reply) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                if tx.send(reply).is_err() {
                    tracing::debug!(%id, "Caller stopped waiting before response arrived");
                }
                true
            }
            None => {
                tracing::warn!(%id, "Response for unknown request id, dropping");
                false
            }
        }
    }

    /// Drop an entry without settling it (e.g. the request never made it out).
    pub fn forget(&self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Reject every pending entry with `EngineExited` and refuse new ones.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                tracing::warn!(%id, "Failing request due to engine exit");
                let _ = tx.send(Err(RpcError::EngineExited));
                failed += 1;
            }
        }
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
