//! IPC bridge between the host and the recording engine.
//!
//! This module provides the wire protocol, the line codec and the process
//! transport used to talk to the engine subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request/Response), procedures, ids, status codes
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: Engine process spawning and stream wiring

pub mod codec;
pub mod protocol;
pub mod transport;
