//! Test helpers: a scripted native backend and throwaway model files.

pub mod scripted_backend;

pub use scripted_backend::{ScriptStep, ScriptedBackend, ScriptedContext};

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::config::ModelConfig;
use crate::engine::ModelKind;

/// A temporary `.gguf` file with a valid magic header.
pub fn model_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("test-model-")
        .suffix(".gguf")
        .tempfile()
        .expect("Failed to create temp model file");
    file.write_all(b"GGUF").expect("Failed to write model header");
    file.write_all(&[0u8; 60]).expect("Failed to write model body");
    file.flush().expect("Failed to flush model file");
    file
}

/// A temporary diffusion checkpoint. Only its size is checked.
pub fn diffusion_model_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("test-sd-")
        .suffix(".safetensors")
        .tempfile()
        .expect("Failed to create temp model file");
    file.write_all(&[7u8; 128]).expect("Failed to write model body");
    file.flush().expect("Failed to flush model file");
    file
}

/// Model config with short timeouts and the self-test disabled.
pub fn test_model_config(file: &NamedTempFile, kind: ModelKind) -> ModelConfig {
    let mut config = ModelConfig::new(file.path().to_string_lossy(), kind);
    config.num_contexts = 2;
    config.acquire_timeout_seconds = 2;
    config.generation_timeout_seconds = Some(5);
    config.close_grace_seconds = 1;
    config.startup_self_test_enabled = false;
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
