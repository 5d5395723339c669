//! Error types for the Slide IPC substrate.
//!
//! A single error enum covers every component: schema validation at the
//! process boundary, the ref engine, the pub/sub bus, the RPC transport and
//! the persistence store. Each variant maps to a JSON-RPC style error code so
//! failures can be surfaced uniformly to the renderer.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Slide IPC substrate.
#[derive(Debug, Error)]
pub enum SlideError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Data crossing a process boundary did not match its schema.
    #[error("Validation failed for {context}: {message}")]
    Validation { context: String, message: String },

    // Ref engine errors
    #[error("Ref not found: {ref_id}")]
    RefNotFound { ref_id: String },

    #[error("Ref {ref_id} already exists with value type {existing}")]
    RefTypeMismatch { ref_id: String, existing: String },

    #[error("Ref {ref_id} has been closed")]
    RefClosed { ref_id: String },

    // Host/connection errors
    #[error("Connection {connection_id} is closed")]
    ConnectionClosed { connection_id: u32 },

    #[error("Message port is closed")]
    PortClosed,

    // RPC errors
    #[error("Procedure not found: {procedure}")]
    ProcedureNotFound { procedure: String },

    #[error("Procedure already registered: {procedure}")]
    DuplicateProcedure { procedure: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Request {request_id} was interrupted")]
    Interrupted { request_id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The remote handler failed with a typed error value.
    #[error("RPC {procedure} failed: {error}")]
    Rpc {
        procedure: String,
        error: serde_json::Value,
    },

    /// The remote side died while processing a request.
    #[error("RPC defect: {message}")]
    RpcDefect { message: String },

    // Pub/sub errors
    #[error("Event bus is shut down")]
    BusShutdown,

    // Persistence errors
    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Store at {path} is locked by another process")]
    StoreLocked { path: PathBuf },

    // Renderer client errors
    #[error("RPC client has been cleaned up")]
    ClientClosed,

    #[error("Failed to connect RPC client: {message}")]
    ClientConnect { message: String },

    #[error("Connection lost while waiting for request {request_id}")]
    ConnectionLost { request_id: String },

    #[error("Watcher error: {message}")]
    Watcher { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,
}

/// Result type alias for Slide operations.
pub type Result<T> = std::result::Result<T, SlideError>;

impl From<std::io::Error> for SlideError {
    fn from(err: std::io::Error) -> Self {
        SlideError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SlideError {
    fn from(err: serde_json::Error) -> Self {
        SlideError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<notify::Error> for SlideError {
    fn from(err: notify::Error) -> Self {
        SlideError::Watcher {
            message: err.to_string(),
        }
    }
}

impl From<crate::cancel::CancelledError> for SlideError {
    fn from(_: crate::cancel::CancelledError) -> Self {
        SlideError::Cancelled
    }
}

impl SlideError {
    /// Shorthand for a validation failure.
    pub fn validation(context: impl Into<String>, message: impl ToString) -> Self {
        SlideError::Validation {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Get the JSON-RPC error code for this error.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            SlideError::Json { .. } => -32700,

            SlideError::Protocol { .. } => -32600,

            SlideError::ProcedureNotFound { .. } => -32601,

            SlideError::InvalidParams { .. } | SlideError::Validation { .. } => -32602,

            SlideError::Rpc { .. } => -32000,

            SlideError::RefNotFound { .. }
            | SlideError::RefTypeMismatch { .. }
            | SlideError::RefClosed { .. } => -32001,

            SlideError::ConnectionClosed { .. }
            | SlideError::PortClosed
            | SlideError::ConnectionLost { .. } => -32002,

            SlideError::Interrupted { .. } | SlideError::Cancelled => -32003,

            SlideError::ClientClosed | SlideError::ClientConnect { .. } => -32004,

            SlideError::BusShutdown => -32005,

            SlideError::Store { .. } | SlideError::StoreLocked { .. } => -32006,

            SlideError::RpcDefect { .. } => -32007,

            SlideError::DuplicateProcedure { .. } | SlideError::Config { .. } => -32008,

            SlideError::Watcher { .. } => -32009,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Whether the error means the other end of a connection has gone away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            SlideError::ConnectionClosed { .. }
                | SlideError::PortClosed
                | SlideError::ConnectionLost { .. }
                | SlideError::ClientClosed
        )
    }

    /// Decode the typed error carried by a failed RPC call.
    pub fn rpc_error<E: serde::de::DeserializeOwned>(&self) -> Option<E> {
        match self {
            SlideError::Rpc { error, .. } => serde_json::from_value(error.clone()).ok(),
            _ => None,
        }
    }
}
