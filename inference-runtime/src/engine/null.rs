//! Engine used when no native backend exists on this platform.

use async_trait::async_trait;
use inference_common::{ImageRequest, ImageResponse, TextRequest, TextResponse, VisionRequest};

use super::{BackendInfo, InferenceEngine, ModelInfo};
use crate::client::ClientMetrics;
use crate::error::{GenerationError, Result};

/// No-op engine. Validates requests, then reports the backend unavailable.
#[derive(Debug, Clone)]
pub struct NullEngine {
    reason: String,
}

impl Default for NullEngine {
    fn default() -> Self {
        Self::new("no native inference backend is available on this platform")
    }
}

impl NullEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(GenerationError::backend_unavailable(self.reason.clone()))
    }
}

#[async_trait]
impl InferenceEngine for NullEngine {
    fn engine_type(&self) -> &'static str {
        "null"
    }

    async fn infer(&self, request: TextRequest) -> Result<TextResponse> {
        request.validate()?;
        self.unavailable()
    }

    async fn infer_vision(&self, request: VisionRequest) -> Result<TextResponse> {
        request.validate()?;
        self.unavailable()
    }

    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse> {
        request.validate()?;
        self.unavailable()
    }

    fn is_ready(&self) -> bool {
        false
    }

    fn model_info(&self) -> Option<ModelInfo> {
        None
    }

    fn backend_info(&self) -> BackendInfo {
        BackendInfo {
            name: "none".to_string(),
            available: false,
            device: None,
        }
    }

    fn metrics(&self) -> ClientMetrics {
        ClientMetrics::default()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_null_engine_reports_unavailable() {
        let engine = NullEngine::default();
        let err = engine.infer(TextRequest::new("Hello")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BackendUnavailable);
        assert!(!err.retryable);
        assert!(!engine.is_ready());
        assert!(engine.model_info().is_none());
        assert!(!engine.backend_info().available);
    }

    #[tokio::test]
    async fn test_null_engine_validates_first() {
        let engine = NullEngine::default();
        let err = engine
            .generate(ImageRequest::new("fox").with_size(100, 512))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }
}
