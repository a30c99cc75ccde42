//! Wire protocol types and codec.
//!
//! Protocol: newline-delimited JSON over TCP.
//!
//! Request format: `{"op": "submit_work", ...}\n`
//! Response format: `{"ok": ...}\n` or `{"err": {"code": "...", "message": "..."}}\n`
//!
//! Every request carries a `user_data` string; the server's verifier maps it
//! to an authenticated user and session. Payloads are opaque to this layer.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequence::SequenceNumber;

/// RPC request. `P` is the work payload type, `D` the reinit payload type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[serde(bound(
    serialize = "P: Serialize, D: Serialize",
    deserialize = "P: DeserializeOwned, D: DeserializeOwned"
))]
pub enum Request<P, D> {
    /// Enqueue one unit of work. The reply is parked until the worker has
    /// run the payload (or an error is committed instead).
    SubmitWork {
        user_data: String,
        payload: P,
        sequence_num: SequenceNumber,
    },

    /// Register `reinit_id` as the latest candidate reinit for the caller's
    /// session.
    ReinitNotify { user_data: String, reinit_id: u32 },

    /// Park until the server either wants the upload (true) or abandons it
    /// (false).
    ReinitPending { user_data: String, reinit_id: u32 },

    /// Deliver the reinit payload; stored only if `reinit_id` matches the
    /// session's pending id.
    ReinitUpload {
        user_data: String,
        data: D,
        reinit_id: u32,
    },

    /// Mark the caller's session as requiring reinit before its next work.
    ReinitEnforce { user_data: String },
}

impl<P, D> Request<P, D> {
    pub fn user_data(&self) -> &str {
        match self {
            Request::SubmitWork { user_data, .. }
            | Request::ReinitNotify { user_data, .. }
            | Request::ReinitPending { user_data, .. }
            | Request::ReinitUpload { user_data, .. }
            | Request::ReinitEnforce { user_data } => user_data,
        }
    }

    /// Short operation name for log lines.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::SubmitWork { .. } => "submit_work",
            Request::ReinitNotify { .. } => "reinit_notify",
            Request::ReinitPending { .. } => "reinit_pending",
            Request::ReinitUpload { .. } => "reinit_upload",
            Request::ReinitEnforce { .. } => "reinit_enforce",
        }
    }
}

/// RPC response. `R` is the worker's output type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
#[serde(bound(
    serialize = "R: Serialize",
    deserialize = "R: DeserializeOwned"
))]
pub enum Response<R> {
    Ok { ok: ResponsePayload<R> },
    Err { err: ErrorPayload },
}

impl<R> Response<R> {
    pub fn ok(payload: ResponsePayload<R>) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(error: impl Into<ErrorPayload>) -> Self {
        Response::Err { err: error.into() }
    }

    pub fn into_result(self) -> Result<ResponsePayload<R>, ErrorPayload> {
        match self {
            Response::Ok { ok } => Ok(ok),
            Response::Err { err } => Err(err),
        }
    }
}

/// Successful response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
#[serde(bound(
    serialize = "R: Serialize",
    deserialize = "R: DeserializeOwned"
))]
pub enum ResponsePayload<R> {
    /// Completed work unit.
    Work { value: R },
    /// Resolution of a parked `reinit_pending` call.
    Pending { upload: bool },
    /// Acknowledgement for notify/upload/enforce.
    Ack,
}

/// Error committed to a reply context.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorPayload {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Verifier rejected the caller's user data.
    pub fn user_not_authorized() -> Self {
        ErrorPayload::new("user_not_authorized", "user is not authorized")
    }

    /// Submitted sequence number is below the session's counter.
    pub fn invalid_sequence_number(actual: u64, expected: u64) -> Self {
        ErrorPayload::new(
            "invalid_sequence_number",
            format!("work unit had sequence number {actual} but processing expected {expected}"),
        )
    }

    /// The worker faulted while running the unit.
    pub fn worker_fault(message: impl Into<String>) -> Self {
        ErrorPayload::new("worker_fault", message)
    }

    /// The server refused the connection or call because it is stopping.
    pub fn shutting_down() -> Self {
        ErrorPayload::new("shutting_down", "server is shutting down")
    }
}

// =============================================================================
// RpcError
// =============================================================================

/// Transport-level errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer disconnected")]
    Disconnected,

    #[error("call rejected: {0}")]
    Rejected(ErrorPayload),

    #[error("call cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Parse(_) => "parse_error",
            RpcError::Io(_) => "io_error",
            RpcError::Disconnected => "disconnected",
            RpcError::Rejected(_) => "rejected",
            RpcError::Cancelled => "cancelled",
        }
    }

    /// Whether retrying the call may succeed without changing inputs.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Io(_) | RpcError::Disconnected)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Encode a value as one ndjson line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a value from one ndjson line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, RpcError> {
    Ok(serde_json::from_str(line)?)
}

/// Send one value over a stream.
pub fn send_line<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), RpcError> {
    let bytes = encode_line(value)?;
    stream.write_all(&bytes)?;
    Ok(())
}

/// Read one line from a buffered reader. `Ok(None)` means clean EOF.
pub fn read_line<S: Read>(reader: &mut BufReader<S>) -> Result<Option<String>, RpcError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req: Request<String, String> = Request::SubmitWork {
            user_data: "alice:exp0".into(),
            payload: "payload".into(),
            sequence_num: SequenceNumber::new(3),
        };
        let line = encode_line(&req).unwrap();
        let text = String::from_utf8(line).unwrap();
        let back: Request<String, String> = decode_line(text.trim()).unwrap();
        match back {
            Request::SubmitWork { sequence_num, .. } => {
                assert_eq!(sequence_num, SequenceNumber::new(3));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn response_ok_and_err_are_distinguished() {
        let ok: Response<u64> = Response::ok(ResponsePayload::Work { value: 9 });
        let text = String::from_utf8(encode_line(&ok).unwrap()).unwrap();
        let back: Response<u64> = decode_line(text.trim()).unwrap();
        match back.into_result().unwrap() {
            ResponsePayload::Work { value } => assert_eq!(value, 9),
            other => panic!("unexpected payload: {other:?}"),
        }

        let err: Response<u64> = Response::err(ErrorPayload::user_not_authorized());
        let text = String::from_utf8(encode_line(&err).unwrap()).unwrap();
        let back: Response<u64> = decode_line(text.trim()).unwrap();
        let payload = back.into_result().unwrap_err();
        assert_eq!(payload.code, "user_not_authorized");
    }

    #[test]
    fn pending_payload_roundtrip() {
        let resp: Response<u64> = Response::ok(ResponsePayload::Pending { upload: true });
        let text = String::from_utf8(encode_line(&resp).unwrap()).unwrap();
        let back: Response<u64> = decode_line(text.trim()).unwrap();
        match back.into_result().unwrap() {
            ResponsePayload::Pending { upload } => assert!(upload),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
