//! Inference engine abstraction layer.
//!
//! This module defines the `InferenceEngine` trait that callers program
//! against. The pooled client, the recovery wrapper and the null engine
//! all implement it, so a dispatcher never needs to know whether a native
//! backend is present on this platform.

mod null;
mod registry;

pub use null::NullEngine;
pub use registry::EngineRegistry;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inference_common::{ImageRequest, ImageResponse, TextRequest, TextResponse, VisionRequest};
use serde::{Deserialize, Serialize};

use crate::backend::GpuMemory;
use crate::client::ClientMetrics;
use crate::error::Result;
use crate::pool::PoolStats;
use crate::recovery::RecoveryStats;

/// Workload family a model serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Text and vision language models (GGUF).
    #[default]
    Language,
    /// Image generation models.
    Diffusion,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Language => write!(f, "language"),
            ModelKind::Diffusion => write!(f, "diffusion"),
        }
    }
}

/// Information about the model an engine serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name, taken from the file stem.
    pub name: String,
    pub path: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// False once the engine has been closed.
    pub loaded: bool,
    pub max_concurrent: usize,
    pub loaded_at: DateTime<Utc>,
}

impl ModelInfo {
    pub fn describe(path: &Path, kind: ModelKind, max_concurrent: usize) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path: path.display().to_string(),
            kind,
            size_bytes: std::fs::metadata(path).ok().map(|m| m.len()),
            loaded: true,
            max_concurrent,
            loaded_at: Utc::now(),
        }
    }
}

/// Native backend description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub available: bool,
    #[serde(default)]
    pub device: Option<String>,
}

/// Primary trait for inference engines.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Short identifier for this engine variant (e.g., "pooled", "null").
    fn engine_type(&self) -> &'static str;

    /// Text completion.
    async fn infer(&self, request: TextRequest) -> Result<TextResponse>;

    /// Text completion about an image.
    async fn infer_vision(&self, request: VisionRequest) -> Result<TextResponse>;

    /// Image generation.
    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse>;

    /// True when requests can be served right now.
    fn is_ready(&self) -> bool;

    fn model_info(&self) -> Option<ModelInfo>;

    fn backend_info(&self) -> BackendInfo;

    fn metrics(&self) -> ClientMetrics;

    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }

    fn recovery_stats(&self) -> Option<RecoveryStats> {
        None
    }

    fn gpu_memory(&self) -> Option<GpuMemory> {
        None
    }

    /// Stop accepting work and release native resources. Idempotent.
    async fn close(&self);
}
