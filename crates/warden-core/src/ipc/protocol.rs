//! Wire format between host and worker.
//!
//! Every message is one length-prefixed MessagePack document:
//!
//! ```text
//! [u32 BE: len][MessagePack bytes of len]
//! ```
//!
//! Requests are 4-tuples `(context_id, function, args, kwargs)` and responses are
//! 3-tuples `(is_error, error_detail, payload)`. MessagePack is self-describing,
//! so the same codec carries both directions without a schema.

use crate::config::WorkerConfig;
use crate::functions::Function;
use crate::value::{ContextId, HandleId, Kwargs, RemoteError, Value, WireValue};
use crate::{Result, WardenError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

type RequestFrame = (
    Option<ContextId>,
    Option<Function>,
    Vec<WireValue>,
    Kwargs<HandleId>,
);

/// A request from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RequestFrame", into = "RequestFrame")]
pub struct Request {
    /// `None` runs the function without a context.
    pub context_id: Option<ContextId>,
    /// `None` together with a context id discards that context.
    pub function: Option<Function>,
    pub args: Vec<WireValue>,
    pub kwargs: Kwargs<HandleId>,
}

/// What a request asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Administrative(Function),
    Call(ContextId, Function),
    Discard(ContextId),
    Invalid,
}

impl Request {
    /// Run `function` inside the context `context_id`.
    pub fn call(
        context_id: ContextId,
        function: Function,
        args: Vec<WireValue>,
        kwargs: Kwargs<HandleId>,
    ) -> Self {
        Self {
            context_id: Some(context_id),
            function: Some(function),
            args,
            kwargs,
        }
    }

    /// Run `function` with no context.
    pub fn administrative(function: Function, args: Vec<WireValue>, kwargs: Kwargs<HandleId>) -> Self {
        Self {
            context_id: None,
            function: Some(function),
            args,
            kwargs,
        }
    }

    /// Drop the context `context_id` in the worker.
    pub fn discard(context_id: ContextId) -> Self {
        Self {
            context_id: Some(context_id),
            function: None,
            args: vec![],
            kwargs: Kwargs::new(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.context_id, self.function) {
            (None, Some(function)) => RequestKind::Administrative(function),
            (Some(id), Some(function)) => RequestKind::Call(id, function),
            (Some(id), None) => RequestKind::Discard(id),
            (None, None) => RequestKind::Invalid,
        }
    }
}

impl From<RequestFrame> for Request {
    fn from((context_id, function, args, kwargs): RequestFrame) -> Self {
        Self {
            context_id,
            function,
            args,
            kwargs,
        }
    }
}

impl From<Request> for RequestFrame {
    fn from(request: Request) -> Self {
        (
            request.context_id,
            request.function,
            request.args,
            request.kwargs,
        )
    }
}

type ResponseFrame = (bool, Option<String>, WireValue);

/// A reply from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ResponseFrame", into = "ResponseFrame")]
pub struct Response {
    pub is_error: bool,
    /// Trace text of the failure; unused on success.
    pub error_detail: Option<String>,
    /// Return value, or the [`Value::Error`] on failure.
    pub payload: WireValue,
}

impl Response {
    pub fn success(payload: WireValue) -> Self {
        Self {
            is_error: false,
            error_detail: None,
            payload,
        }
    }

    pub fn error(err: RemoteError) -> Self {
        Self {
            is_error: true,
            error_detail: err.trace.clone(),
            payload: Value::Error(err),
        }
    }

    /// Split into the return value or the carried error.
    ///
    /// The trace from `error_detail` is attached to the error.
    pub fn into_result(self) -> std::result::Result<WireValue, RemoteError> {
        if !self.is_error {
            return Ok(self.payload);
        }
        let err = match self.payload {
            Value::Error(err) => err,
            other => RemoteError::internal(format!(
                "error response carried a {} payload",
                other.type_name()
            )),
        };
        Err(match self.error_detail {
            Some(trace) => err.with_trace(trace),
            None => err,
        })
    }
}

impl From<ResponseFrame> for Response {
    fn from((is_error, error_detail, payload): ResponseFrame) -> Self {
        Self {
            is_error,
            error_detail,
            payload,
        }
    }
}

impl From<Response> for ResponseFrame {
    fn from(response: Response) -> Self {
        (response.is_error, response.error_detail, response.payload)
    }
}

/// Encode a message body without framing.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decode a message body without framing.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed before a new frame started). EOF
/// in the middle of a frame is a codec error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut len_buf[1..])
        .await
        .map_err(truncated)?;

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > WorkerConfig::MAX_MESSAGE_SIZE {
        return Err(WardenError::Codec {
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                WorkerConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > WorkerConfig::MAX_MESSAGE_SIZE {
        return Err(WardenError::Codec {
            message: format!(
                "message size {} exceeds maximum {}",
                payload.len(),
                WorkerConfig::MAX_MESSAGE_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message. `None` means the peer closed the stream.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(decode(&frame)?)),
        None => Ok(None),
    }
}

/// Encode and write one message.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let bytes = encode(message)?;
    write_frame(writer, &bytes).await
}

fn truncated(err: std::io::Error) -> WardenError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WardenError::Codec {
            message: "stream ended inside a frame".to_string(),
        }
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorKind;
    use std::collections::BTreeMap;

    fn sample_payload() -> WireValue {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::Str("module".into()));
        map.insert("ratio".to_string(), Value::Float(0.25));
        map.insert("raw".to_string(), Value::Bytes(vec![0, 255, 7]));
        Value::List(vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int(-42),
            Value::Map(map),
            Value::Handle(HandleId(3)),
            Value::List(vec![Value::Handle(HandleId(3)), Value::Str("nested".into())]),
        ])
    }

    #[tokio::test]
    async fn test_request_roundtrip_over_stream() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("path".to_string(), Value::Str("/tmp/x".into()));
        let request = Request::call(7, Function::Echo, vec![sample_payload()], kwargs);

        let mut buf = Vec::new();
        write_message(&mut buf, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back: Request = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read_back, request);
        assert_eq!(read_back.kind(), RequestKind::Call(7, Function::Echo));
    }

    #[tokio::test]
    async fn test_discard_and_administrative_requests_roundtrip() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Request::discard(7)).await.unwrap();
        write_message(
            &mut buf,
            &Request::administrative(Function::GetSysPath, vec![], Kwargs::new()),
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: Request = read_message(&mut cursor).await.unwrap().unwrap();
        let second: Request = read_message(&mut cursor).await.unwrap().unwrap();
        let end: Option<Request> = read_message(&mut cursor).await.unwrap();

        assert_eq!(first.kind(), RequestKind::Discard(7));
        assert_eq!(second.kind(), RequestKind::Administrative(Function::GetSysPath));
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_error_response_roundtrip_keeps_trace_and_fields() {
        let err = RemoteError::new(ErrorKind::Other("overflow".into()), "too big")
            .with_field("limit", Value::Int(10))
            .with_trace("Traceback: overflow in echo");
        let mut buf = Vec::new();
        write_message(&mut buf, &Response::error(err)).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let response: Response = read_message(&mut cursor).await.unwrap().unwrap();
        assert!(response.is_error);

        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Other("overflow".into()));
        assert_eq!(err.fields["limit"], Value::Int(10));
        assert_eq!(err.trace.as_deref(), Some("Traceback: overflow in echo"));
    }

    #[test]
    fn test_success_response_into_result() {
        let response = Response::success(Value::Str("hello".into()));
        assert_eq!(response.into_result().unwrap(), Value::Str("hello".into()));
    }

    #[test]
    fn test_malformed_error_response_becomes_internal_error() {
        let response = Response {
            is_error: true,
            error_detail: None,
            payload: Value::Int(1),
        };
        assert_eq!(response.into_result().unwrap_err().kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_truncated_payload_is_codec_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&16u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor).await {
            Err(WardenError::Codec { message }) => assert!(message.contains("inside a frame")),
            other => panic!("Expected codec error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frame_read_truncated_header_is_codec_error() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WardenError::Codec { .. })
        ));
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (WorkerConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_decode_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0xc1, 0xc1, 0xc1]).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Option<Request>> = read_message(&mut cursor).await;
        assert!(matches!(result, Err(WardenError::Codec { .. })));
    }
}
