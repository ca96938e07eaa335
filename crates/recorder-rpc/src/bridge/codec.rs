//! Newline-delimited JSON codec for the engine's standard streams.
//!
//! Uses AnyDelimiterCodec for framing + serde_json for serialization.
//! Malformed lines decode to `Err(DecodeError)` items instead of stream errors,
//! so one bad line never ends the connection.

use std::io;

use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Envelope, Request, RequestId, Response};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    /// A response that names a request but is otherwise unusable.
    #[error("invalid response to {id}: {source}")]
    Response {
        id: RequestId,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {kind} envelope: {source}")]
    Shape {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize an envelope to a single line of JSON (without the trailing newline).
///
/// serde_json escapes control characters inside strings, so the output never
/// contains an embedded newline.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse one line. Shape discrimination only: `status` present means response.
pub fn decode(line: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(line).map_err(DecodeError::Malformed)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    if value.get("status").is_some() {
        let id = value.get("id").and_then(Value::as_str).map(RequestId::from);
        serde_json::from_value::<Response>(value)
            .map(Envelope::Response)
            .map_err(|source| match id {
                Some(id) => DecodeError::Response { id, source },
                None => DecodeError::Shape {
                    kind: "response",
                    source,
                },
            })
    } else {
        serde_json::from_value::<Request>(value)
            .map(Envelope::Request)
            .map_err(|source| DecodeError::Shape {
                kind: "request",
                source,
            })
    }
}

/// Codec that frames envelopes with `\n` and serializes with JSON.
///
/// Decoded items are themselves results: a line that fails to parse yields
/// `Ok(Some(Err(_)))` and the stream carries on with the next line.
pub struct LineJsonCodec {
    inner: AnyDelimiterCodec,
}

impl Default for LineJsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineJsonCodec {
    pub fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec()),
        }
    }

    fn frame(chunk: &[u8]) -> Option<Result<Envelope, DecodeError>> {
        let trimmed = chunk.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        tracing::trace!(line_bytes = trimmed.len(), "Decoding line");
        Some(decode(trimmed))
    }
}

fn into_io(e: AnyDelimiterCodecError) -> io::Error {
    match e {
        AnyDelimiterCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl Decoder for LineJsonCodec {
    type Item = Result<Envelope, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(into_io)? {
                Some(chunk) => {
                    if let Some(item) = Self::frame(&chunk) {
                        return Ok(Some(item));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src).map_err(into_io)? {
                Some(chunk) => {
                    if let Some(item) = Self::frame(&chunk) {
                        return Ok(Some(item));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Envelope> for LineJsonCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(line_bytes = line.len(), "Encoding line");
        self.inner.encode(line, dst).map_err(into_io)
    }
}
