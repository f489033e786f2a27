//! ETX-delimited JSON framing for the Klippy API socket.
//!
//! Every frame is one UTF-8 JSON object followed by a single `0x03` byte.
//! There is no length prefix, so the decoder scans for the delimiter. JSON
//! serialization escapes control characters inside strings, which keeps the
//! delimiter out of any payload we produce.
//!
//! Decoding never fails on bad payloads: a frame that does not parse is
//! surfaced as [`Frame::Malformed`] with its raw bytes so the reader can log
//! it and carry on. Only transport errors end the stream.

use std::io;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::{
    bytes::{BufMut, BytesMut},
    codec::{Decoder, Encoder},
};

/// Frame terminator (ASCII ETX).
pub const ETX: u8 = 0x03;

/// Errors from encoding or reading frames.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure on the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Outbound value could not be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Outbound request frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundRequest {
    /// Correlation id echoed back in the response.
    pub id: u64,
    /// Klippy endpoint name.
    pub method: String,
    /// Endpoint arguments.
    pub params: Map<String, Value>,
}

/// A well-formed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a request previously sent with `id`.
    Response {
        /// Correlation id.
        id: u64,
        /// Normalized result, or the remote error message.
        result: Result<Value, String>,
    },
    /// Id-less push from Klippy.
    Notification {
        /// Method name chosen by the response template.
        method: String,
        /// Notification arguments.
        params: Map<String, Value>,
    },
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Parsed message.
    Message(Inbound),
    /// Bytes between two delimiters that did not form a valid message.
    Malformed {
        /// The offending payload, delimiter excluded.
        raw: Vec<u8>,
        /// Why it was rejected.
        reason: String,
    },
}

/// Codec for `tokio_util::codec::Framed*` over the Klippy socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct KlippyCodec;

impl Decoder for KlippyCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == ETX) else {
                return Ok(None);
            };
            let chunk = src.split_to(pos + 1);
            let payload = &chunk[..pos];
            // Back-to-back delimiters carry nothing worth reporting.
            if payload.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(parse_frame(payload)));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            return Ok(None);
        }
        let raw = buf.split().to_vec();
        Ok(Some(Frame::Malformed {
            raw,
            reason: "unterminated frame at end of stream".to_string(),
        }))
    }
}

impl Encoder<OutboundRequest> for KlippyCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundRequest, dst: &mut BytesMut) -> Result<(), Error> {
        write_frame(&item, dst)
    }
}

/// Serialize `item` into `dst` followed by the delimiter.
fn write_frame<T: Serialize>(item: &T, dst: &mut BytesMut) -> Result<(), Error> {
    let mut writer = dst.writer();
    serde_json::to_writer(&mut writer, item)?;
    writer.into_inner().put_u8(ETX);
    Ok(())
}

/// Parse one frame payload (delimiter already stripped).
pub fn parse_frame(payload: &[u8]) -> Frame {
    let malformed = |reason: String| Frame::Malformed {
        raw: payload.to_vec(),
        reason,
    };
    let value: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => return malformed(format!("invalid json: {e}")),
    };
    let Value::Object(mut obj) = value else {
        return malformed("frame is not a JSON object".to_string());
    };

    if let Some(id) = obj.remove("id") {
        let Some(id) = id.as_u64() else {
            return malformed(format!("unsupported id {id}"));
        };
        let result = match obj.remove("error") {
            Some(err) => Err(error_message(err)),
            None => Ok(normalize_result(obj.remove("result").unwrap_or(Value::Null))),
        };
        return Frame::Message(Inbound::Response { id, result });
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) => m,
        _ => return malformed("notification without a method".to_string()),
    };
    let params = match obj.remove("params") {
        Some(Value::Object(p)) => p,
        None | Some(Value::Null) => Map::new(),
        Some(other) => return malformed(format!("params is not an object: {other}")),
    };
    Frame::Message(Inbound::Notification { method, params })
}

/// Klippy reports empty successes as empty or false-like results. Callers
/// have always seen the literal string `"ok"` for those.
pub fn normalize_result(result: Value) -> Value {
    if is_falsy(&result) {
        Value::String("ok".to_string())
    } else {
        result
    }
}

/// Falsiness as Klippy's clients have historically judged it.
fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Flatten the `error` field into a message. Klippy sends
/// `{"error": "WebRequestError", "message": "..."}`; plain strings are also
/// accepted.
fn error_message(err: Value) -> String {
    match err {
        Value::String(s) => s,
        Value::Object(mut o) => match o.remove("message") {
            Some(Value::String(m)) => m,
            _ => Value::Object(o).to_string(),
        },
        other => other.to_string(),
    }
}
