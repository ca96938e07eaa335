//! Errors surfaced to callers of RPC operations.

use serde_json::Value;

use crate::bridge::protocol::Status;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The engine answered with a non-200 status. `payload` is its `error` field, verbatim.
    #[error("engine returned status {status}: {payload}")]
    Remote { status: Status, payload: Value },
    /// The engine's output stream ended; the request will never be answered.
    #[error("engine exited before responding")]
    EngineExited,
    /// The outbound channel is gone (engine handle shut down).
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The engine's error payload, if this is a remote failure.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Remote { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}
