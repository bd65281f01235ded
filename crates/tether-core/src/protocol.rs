//! Wire protocol shared by the transport client and the server.
//!
//! Every message is a length-prefixed frame holding a JSON event object:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! {"event": "request", "data": {...}}
//! ```
//!
//! Event names and payload shapes are listed in [`event`]. Payload field names
//! are camelCase.

use crate::config::ProtocolConfig;
use crate::{Result, TetherError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Event names carried in [`Frame::event`].
pub mod event {
    pub const HANDSHAKE: &str = "handshake";
    pub const CONNECTED: &str = "connected";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const RESPONSE_CHUNK: &str = "response-chunk";
    pub const HEALTH: &str = "health";
}

/// One event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Frame {
    /// Build a frame from any serializable payload.
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// A frame with no payload.
    pub fn bare(event: &str) -> Self {
        Self {
            event: event.to_string(),
            data: Value::Null,
        }
    }

    /// Decode the payload into a typed envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| TetherError::Protocol {
            message: format!("malformed '{}' payload: {}", self.event, e),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| TetherError::Protocol {
            message: format!("invalid frame: {}", e),
        })
    }
}

/// First frame a client sends on a new connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// Server reply to an accepted handshake, and the `health` reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub ts: i64,
}

impl HealthStatus {
    pub fn now() -> Self {
        Self {
            ok: true,
            ts: now_millis(),
        }
    }
}

/// Payload of an `unauthorized` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub message: String,
}

/// A request as the client sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub timestamp: i64,
}

/// The error object inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    pub name: String,
}

/// The single terminal reply for a request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<WireError>,
    pub took: u64,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, result: Value, took: u64) -> Self {
        Self {
            id: id.into(),
            result,
            error: None,
            took,
        }
    }

    pub fn failure(id: impl Into<String>, error: WireError, took: u64) -> Self {
        Self {
            id: id.into(),
            result: Value::Null,
            error: Some(error),
            took,
        }
    }
}

/// One slice of a streamed array result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEnvelope {
    pub id: String,
    pub chunk: Vec<Value>,
    pub index: u32,
    pub total_chunks: u32,
}

/// Terminal result of a streamed request: the count, never the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamComplete {
    pub streamed: bool,
    pub count: usize,
}

impl StreamComplete {
    pub fn new(count: usize) -> Self {
        Self {
            streamed: true,
            count,
        }
    }
}

/// Build the wire form of a predicate parameter.
///
/// The server compiles `source` with the predicate language in
/// [`crate::filter`]; it never evaluates arbitrary code.
pub fn callable(source: impl Into<String>) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(ProtocolConfig::CALLABLE_MARKER.to_string(), Value::Bool(true));
    map.insert("source".to_string(), Value::String(source.into()));
    Value::Object(map)
}

/// If `value` is a predicate payload, return its source text.
///
/// Returns `Some(Err)` when the marker is present but `source` is missing or
/// not a string.
pub fn callable_source(value: &Value) -> Option<std::result::Result<&str, String>> {
    let obj = value.as_object()?;
    if obj.get(ProtocolConfig::CALLABLE_MARKER) != Some(&Value::Bool(true)) {
        return None;
    }
    Some(
        obj.get("source")
            .and_then(|s| s.as_str())
            .ok_or_else(|| "callable payload is missing a string 'source'".to_string()),
    )
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(TetherError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(TetherError::Protocol {
            message: format!("outgoing frame of {} bytes is too large", payload.len()),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode the next event frame.
pub async fn read_event<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    match read_frame(reader).await? {
        Some(bytes) => Ok(Some(Frame::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write one event frame.
pub async fn write_event<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    write_frame(writer, &frame.to_bytes()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_uses_camel_case() {
        let frame = Frame::new(
            event::RESPONSE_CHUNK,
            &ChunkEnvelope {
                id: "r1".into(),
                chunk: vec![json!(1)],
                index: 0,
                total_chunks: 3,
            },
        )
        .unwrap();
        let text = String::from_utf8(frame.to_bytes().unwrap()).unwrap();

        assert!(text.contains("\"event\":\"response-chunk\""));
        assert!(text.contains("\"totalChunks\":3"));
    }

    #[test]
    fn test_bare_frame_omits_data() {
        let text = String::from_utf8(Frame::bare(event::HEALTH).to_bytes().unwrap()).unwrap();
        assert_eq!(text, r#"{"event":"health"}"#);

        let parsed = Frame::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(parsed.data, Value::Null);
    }

    #[test]
    fn test_response_without_error_field_parses() {
        let frame = Frame::from_bytes(
            br#"{"event":"response","data":{"id":"a","result":[1,2],"took":4}}"#,
        )
        .unwrap();
        let response: ResponseEnvelope = frame.decode().unwrap();

        assert_eq!(response.result, json!([1, 2]));
        assert!(response.error.is_none());
        assert_eq!(response.took, 4);
    }

    #[test]
    fn test_decode_wrong_shape_is_protocol_error() {
        let frame = Frame {
            event: event::RESPONSE.into(),
            data: json!({"nope": true}),
        };
        let result: Result<ResponseEnvelope> = frame.decode();
        assert!(matches!(result, Err(TetherError::Protocol { .. })));
    }

    #[test]
    fn test_callable_detection() {
        let payload = callable("doc => doc.score > 3");
        assert_eq!(callable_source(&payload), Some(Ok("doc => doc.score > 3")));
        assert_eq!(callable_source(&json!({"topK": 5})), None);
        assert_eq!(callable_source(&json!("plain")), None);
        assert!(matches!(
            callable_source(&json!({"__fn": true, "source": 12})),
            Some(Err(_))
        ));
    }

    #[tokio::test]
    async fn test_event_read_write() {
        let frame = Frame::new(event::HEALTH, &HealthStatus { ok: true, ts: 42 }).unwrap();
        let mut buf = Vec::new();
        write_event(&mut buf, &frame).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_event(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read_back, frame);
        assert!(read_event(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
