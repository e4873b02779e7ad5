//! Error types for the relay runtime.
//!
//! Recoverable, per-request failures (timeouts, missing handlers, bad
//! documents) are values of [`RelayError`] returned to the immediate caller.
//! Configuration reads never produce errors: typed accessors fall back to
//! their defaults (see [`crate::coerce`]).

use crate::definition::IoLaneType;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors produced by the runtime.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A configuration value or document is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A single options row names more than one section.
    #[error("multiple section names in the configuration block: {names:?}")]
    AmbiguousSection { names: Vec<String> },

    /// A YAML document could not be parsed.
    #[error("failed to parse document '{name}': {source}")]
    Yaml {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// A JSON payload or document could not be parsed.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Template pre-processing failed.
    #[error("template error in '{name}': {message}")]
    Template { name: String, message: String },

    /// A file could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A frame declared more bytes than are available.
    #[error("framing error: {0}")]
    Framing(String),

    /// Frame body bytes do not match the schema.
    #[error("decode error: {0}")]
    Decode(String),

    /// Deployment rejected by the blacklist.
    #[error("blacklisted: {instance_name}/{stage_type}")]
    Blacklisted {
        instance_name: String,
        stage_type: String,
    },

    /// No stage implementation is registered for the type.
    #[error("unknown stage type: {0}")]
    UnknownStageType(String),

    /// No deployment is tracked under the id.
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    /// A stage failed while starting.
    #[error("stage '{instance_name}' failed to start: {message}")]
    StageStart {
        instance_name: String,
        message: String,
    },

    /// No consumer is registered on the address.
    #[error("no handlers for address {0}")]
    NoHandlers(String),

    /// A bounded wait expired.
    #[error("timed out after {timeout_ms} ms waiting on {address}")]
    Timeout { address: String, timeout_ms: u64 },

    /// The responder explicitly failed the request.
    #[error("request failed ({code}): {message}")]
    ReplyFailed { code: u16, message: String },

    /// A lane name was not declared on the stage.
    #[error("lane not found: {0}")]
    LaneNotFound(String),

    /// The lane exists but has the wrong type for the operation.
    #[error("lane {lane} is {actual:?}, expected {expected:?}")]
    LaneType {
        lane: String,
        expected: IoLaneType,
        actual: IoLaneType,
    },

    /// The bus or a consumer has shut down.
    #[error("channel closed: {0}")]
    Closed(String),
}

impl RelayError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a YAML parse error for the named document.
    pub fn yaml(name: impl Into<String>, source: serde_yaml::Error) -> Self {
        Self::Yaml {
            name: name.into(),
            source,
        }
    }

    /// Creates an IO error for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            address: address.into(),
            timeout_ms,
        }
    }

    /// Returns true for failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NoHandlers(_) | Self::Closed(_)
        )
    }

    /// HTTP-style status code used when the error travels back as a reply.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            Self::NoHandlers(_) => 503,
            Self::LaneNotFound(_) | Self::UnknownStageType(_) | Self::UnknownDeployment(_) => 404,
            Self::Blacklisted { .. } => 403,
            Self::Config(_)
            | Self::AmbiguousSection { .. }
            | Self::Yaml { .. }
            | Self::Json(_)
            | Self::Template { .. }
            | Self::Framing(_)
            | Self::Decode(_)
            | Self::LaneType { .. } => 400,
            Self::ReplyFailed { code, .. } => *code,
            _ => 500,
        }
    }
}
