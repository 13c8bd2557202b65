//! Native backend seam.
//!
//! A `Backend` wraps the vendor inference library. Every method here is a
//! blocking foreign call: the runtime only ever invokes them from the
//! blocking thread pool, never from an async task directly. Once started,
//! a call cannot be interrupted.

use std::path::Path;

use inference_common::{ImageFormat, ImageRequest, StopReason, TextRequest, VisionRequest};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GenerationError};

/// Structured failure codes a binding can attach to its errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCode {
    OutOfMemory,
    Unavailable,
    InvalidInput,
    /// The context is no longer safe to reuse.
    ContextCorrupted,
    Unsupported,
}

/// Error returned by a native call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub code: Option<NativeCode>,
    pub message: String,
}

impl BackendError {
    pub fn new(code: NativeCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// An error carrying only the library's message text.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            NativeCode::Unsupported,
            format!("{} is not supported by this backend", operation),
        )
    }

    /// Whether the context that produced this error must be destroyed.
    pub fn corrupts_context(&self) -> bool {
        self.code == Some(NativeCode::ContextCorrupted)
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Text produced by a language model call.
#[derive(Debug, Clone, PartialEq)]
pub struct TextOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub tokens_generated: u32,
    /// Set by bindings that know why generation ended. Otherwise the
    /// client infers it from the token count.
    pub stop_reason: Option<StopReason>,
}

/// Encoded image produced by a diffusion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOutput {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// GPU memory occupancy in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuMemory {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl GpuMemory {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes() as f64 / self.total_bytes as f64
        }
    }
}

/// A native inference library bound to one model per context.
///
/// Workloads a backend does not implement fall back to an `Unsupported`
/// error, so a diffusion backend only needs `generate_image`.
pub trait Backend: Send + Sync + 'static {
    /// One native execution context. Owned by the pool or by exactly one caller.
    type Context: Send + 'static;

    fn name(&self) -> &str;

    /// False when the hardware, driver or library is missing.
    fn is_available(&self) -> bool {
        true
    }

    fn device_name(&self) -> Option<String> {
        None
    }

    /// Create a context with the model at `model_path` loaded.
    fn create_context(&self, model_path: &Path) -> BackendResult<Self::Context>;

    /// Free a context. The default just drops it.
    fn destroy_context(&self, context: Self::Context) {
        drop(context);
    }

    fn infer_text(
        &self,
        _context: &mut Self::Context,
        _request: &TextRequest,
    ) -> BackendResult<TextOutput> {
        Err(BackendError::unsupported("text inference"))
    }

    fn infer_vision(
        &self,
        _context: &mut Self::Context,
        _request: &VisionRequest,
    ) -> BackendResult<String> {
        Err(BackendError::unsupported("vision inference"))
    }

    /// `seed` is already resolved; it is never `-1`.
    fn generate_image(
        &self,
        _context: &mut Self::Context,
        _request: &ImageRequest,
        _seed: i64,
    ) -> BackendResult<ImageOutput> {
        Err(BackendError::unsupported("image generation"))
    }

    fn gpu_memory(&self) -> Option<GpuMemory> {
        None
    }
}

// Fallback markers for bindings that only report text. Not exhaustive.
const OUT_OF_MEMORY_MARKERS: &[&str] = &[
    "out of memory",
    "vram",
    "cudamalloc failed",
    "failed to allocate",
];
const UNAVAILABLE_MARKERS: &[&str] = &[
    "cuda not available",
    "no cuda-capable device",
    "gpu not available",
];

/// Map a native error onto the runtime's error taxonomy.
///
/// A structured code wins. Without one, the message is matched against
/// known substrings, and anything unrecognised is `GenerationFailed`.
pub fn classify(err: BackendError) -> GenerationError {
    let code = match err.code {
        Some(NativeCode::OutOfMemory) => ErrorCode::OutOfMemory,
        Some(NativeCode::Unavailable) => ErrorCode::BackendUnavailable,
        Some(NativeCode::InvalidInput) => ErrorCode::InvalidRequest,
        Some(NativeCode::ContextCorrupted) | Some(NativeCode::Unsupported) => {
            ErrorCode::GenerationFailed
        }
        None => classify_message(&err.message),
    };
    GenerationError::new(code, err.message.clone()).with_cause(err)
}

fn classify_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if OUT_OF_MEMORY_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorCode::OutOfMemory
    } else if UNAVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorCode::BackendUnavailable
    } else {
        ErrorCode::GenerationFailed
    }
}

/// Backend for platforms without a native library.
///
/// Reports itself unavailable and refuses to create contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl Backend for NullBackend {
    type Context = ();

    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn create_context(&self, _model_path: &Path) -> BackendResult<()> {
        Err(BackendError::new(
            NativeCode::Unavailable,
            "no native inference backend is available on this platform",
        ))
    }
}
