//! recorder-rpc: host-side runtime for an out-of-process recording engine.
//!
//! The engine runs as a child process speaking newline-delimited JSON over its
//! standard streams. [`Engine`] owns that connection; [`Recorder`] is a proxy for
//! one engine-side recorder.

mod closures;
mod correlation;
mod lifecycle;
mod version;

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod recorder;

pub use engine::Engine;
pub use recorder::{RECORDER_TYPE, Recorder, item_schema};

pub use bridge::codec::{DecodeError, LineJsonCodec};
pub use bridge::protocol::{
    Envelope, PROTOCOL_VERSION, Procedure, Request, RequestId, Response, Status, TargetId,
};
pub use bridge::transport::{BinarySpawner, EngineSpawner, SpawnError};
pub use closures::{ClosureHandle, ClosureHandler, ClosureRegistry, InvokeError};
pub use config::EngineConfig;
pub use correlation::{CorrelationTable, PendingReply};
pub use error::RpcError;
pub use lifecycle::{Lifecycle, ReleaseGuard};
pub use logging::{EngineLogLevel, EngineLogLine, init_tracing};
pub use version::{RECORDER_RPC_VERSION, VersionInfo};
