//! Error types for the inference runtime.

use std::fmt;

use inference_common::ValidationError;
use serde::{Deserialize, Serialize};

/// Closed set of failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request failed validation before any pool interaction.
    InvalidRequest,
    ModelNotFound,
    ModelLoadFailed,
    /// Required hardware, driver or library is absent.
    BackendUnavailable,
    /// Transient VRAM or memory pressure.
    OutOfMemory,
    /// Acquisition or generation deadline exceeded.
    Timeout,
    /// Unclassified backend failure.
    GenerationFailed,
    PoolClosed,
}

impl ErrorCode {
    /// Whether errors of this kind are worth retrying by default.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::OutOfMemory | ErrorCode::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::ModelNotFound => "model_not_found",
            ErrorCode::ModelLoadFailed => "model_load_failed",
            ErrorCode::BackendUnavailable => "backend_unavailable",
            ErrorCode::OutOfMemory => "out_of_memory",
            ErrorCode::Timeout => "timeout",
            ErrorCode::GenerationFailed => "generation_failed",
            ErrorCode::PoolClosed => "pool_closed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A classified failure from the pool, client, loader or recovery layer.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GenerationError {
    pub code: ErrorCode,
    pub message: String,
    /// Whether the caller may retry the same request.
    pub retryable: bool,
    #[source]
    pub cause: Option<Cause>,
}

impl GenerationError {
    /// Build an error with the code's default retryability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelNotFound, message)
    }

    pub fn model_load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelLoadFailed, message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BackendUnavailable, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OutOfMemory, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GenerationFailed, message)
    }

    pub fn pool_closed() -> Self {
        Self::new(ErrorCode::PoolClosed, "context pool is closed")
    }
}

impl From<ValidationError> for GenerationError {
    fn from(err: ValidationError) -> Self {
        GenerationError::invalid_request(err.to_string()).with_cause(err)
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;
