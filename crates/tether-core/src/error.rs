//! Error types for the Tether transport.
//!
//! Every call against the transport either resolves with a value or fails with
//! one of these kinds. Kinds that cross the wire are carried as a
//! [`WireError`] (`{name, message}`) and mapped back on the client.

use crate::protocol::WireError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Tether transport.
#[derive(Debug, Error)]
pub enum TetherError {
    // Client-side resolution errors
    #[error("RequestTimeout: no response for request {id} within {timeout:?}")]
    RequestTimeout { id: String, timeout: Duration },

    #[error("StreamIncomplete: request {id} completed with missing chunk indices {missing:?}")]
    StreamIncomplete { id: String, missing: Vec<u32> },

    #[error("Transport closed")]
    Closed,

    #[error("Not connected to server")]
    NotConnected,

    // Dispatch errors (travel over the wire)
    #[error("ServerTimeout: {method} exceeded dispatch deadline of {}ms", .deadline.as_millis())]
    ServerTimeout { method: String, deadline: Duration },

    #[error("MethodNotFound: {method}")]
    MethodNotFound { method: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("DeserializationError: {message}")]
    Deserialization { message: String },

    #[error("InvalidRequest: {message}")]
    InvalidRequest { message: String },

    #[error("{name}: {message}")]
    Server { name: String, message: String },

    // Local I/O and framing
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Configuration errors
    #[error("Configuration error for {field}: {message}")]
    Config { field: String, message: String },
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TetherError {
    /// Wire name of this error kind.
    pub fn kind_name(&self) -> &str {
        match self {
            TetherError::RequestTimeout { .. } => "RequestTimeout",
            TetherError::StreamIncomplete { .. } => "StreamIncomplete",
            TetherError::Closed => "Closed",
            TetherError::NotConnected => "NotConnected",
            TetherError::ServerTimeout { .. } => "ServerTimeout",
            TetherError::MethodNotFound { .. } => "MethodNotFound",
            TetherError::Unauthorized { .. } => "Unauthorized",
            TetherError::Deserialization { .. } => "DeserializationError",
            TetherError::InvalidRequest { .. } => "InvalidRequest",
            TetherError::Server { name, .. } => name,
            TetherError::Io { .. } => "IoError",
            TetherError::Json { .. } => "JsonError",
            TetherError::Protocol { .. } => "ProtocolError",
            TetherError::Config { .. } => "ConfigError",
        }
    }

    /// Convert to the `{name, message}` object carried in a response envelope.
    ///
    /// The message is the full display string, so it always begins with the
    /// kind name (`"MethodNotFound: frobnicate"`).
    pub fn to_wire(&self) -> WireError {
        WireError {
            name: self.kind_name().to_string(),
            message: self.to_string(),
        }
    }

    /// Rebuild a typed error from a wire error object.
    ///
    /// Unknown names become [`TetherError::Server`] with the remote name kept.
    pub fn from_wire(err: WireError) -> Self {
        let detail = strip_kind_prefix(&err.name, &err.message);
        match err.name.as_str() {
            "MethodNotFound" => TetherError::MethodNotFound { method: detail },
            "Unauthorized" => TetherError::Unauthorized { message: detail },
            "DeserializationError" => TetherError::Deserialization { message: detail },
            "InvalidRequest" => TetherError::InvalidRequest { message: detail },
            "ServerTimeout" => parse_server_timeout(detail),
            _ => TetherError::Server {
                name: err.name,
                message: err.message,
            },
        }
    }

    /// True for errors produced by the server's dispatch deadline.
    pub fn is_server_timeout(&self) -> bool {
        matches!(self, TetherError::ServerTimeout { .. })
    }
}

/// Recover method and deadline from `"<method> exceeded dispatch deadline of <n>ms"`.
///
/// A message in any other shape keeps its text as the method and a zero deadline.
fn parse_server_timeout(detail: String) -> TetherError {
    let parsed = detail
        .rsplit_once(" exceeded dispatch deadline of ")
        .and_then(|(method, deadline)| {
            let millis = deadline.strip_suffix("ms")?.parse::<u64>().ok()?;
            Some((method.to_string(), Duration::from_millis(millis)))
        });
    match parsed {
        Some((method, deadline)) => TetherError::ServerTimeout { method, deadline },
        None => TetherError::ServerTimeout {
            method: detail,
            deadline: Duration::ZERO,
        },
    }
}

fn strip_kind_prefix(name: &str, message: &str) -> String {
    message
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(": "))
        .unwrap_or(message)
        .to_string()
}

/// Error returned by registered engine handlers and by persistence.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid params: {message}")]
    InvalidParams { message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Wire name used when this error is reported to a client.
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::InvalidParams { .. } => "InvalidParams",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Storage { .. } => "StorageError",
            EngineError::Other(_) => "ServerError",
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        EngineError::InvalidParams {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Other(format!("JSON error: {}", err))
    }
}

impl From<EngineError> for TetherError {
    fn from(err: EngineError) -> Self {
        TetherError::Server {
            name: err.name().to_string(),
            message: err.to_string(),
        }
    }
}
