//! Model loading and startup self-test.
//!
//! A model that loads but cannot run a minimal request is a load failure,
//! not a runtime failure: the loader closes what it built and reports
//! `ModelLoadFailed`. The same goes for a file whose SHA-256 does not
//! match the configured digest.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use inference_common::{ImageRequest, TextRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::Backend;
use crate::client::{ClientConfig, InferenceClient};
use crate::config::ModelConfig;
use crate::engine::ModelKind;
use crate::error::{GenerationError, Result};
use crate::pool::ContextPool;

/// Magic bytes at the start of every GGUF file.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestOutcome {
    pub status: SelfTestStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl SelfTestOutcome {
    fn skipped() -> Self {
        Self {
            status: SelfTestStatus::Skipped,
            duration_ms: 0,
            error: None,
        }
    }
}

/// What the loader learned about a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub path: String,
    pub kind: ModelKind,
    pub size_bytes: u64,
    pub size_human: String,
    pub loaded_at: DateTime<Utc>,
    pub self_test: SelfTestOutcome,
}

/// Builds clients for one configured model.
pub struct ModelLoader<B: Backend> {
    backend: Arc<B>,
    config: ModelConfig,
    metadata: Mutex<Option<ModelMetadata>>,
}

impl<B: Backend> ModelLoader<B> {
    pub fn new(backend: Arc<B>, config: ModelConfig) -> Self {
        Self {
            backend,
            config,
            metadata: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Validate configuration and model file without creating contexts.
    pub fn inspect(&self) -> Result<ModelMetadata> {
        self.config
            .validate()
            .map_err(GenerationError::model_load_failed)?;
        let path = self.config.resolved_model_path();
        let size_bytes = validate_model_file(&path, self.config.kind)?;
        if let Some(ref expected) = self.config.sha256 {
            verify_checksum(&path, expected)?;
        }
        let metadata = describe(&path, self.config.kind, size_bytes, SelfTestOutcome::skipped());
        self.store(metadata.clone());
        Ok(metadata)
    }

    /// Build a pool and client, then run the startup self-test if enabled.
    pub async fn load(&self) -> Result<InferenceClient<B>> {
        self.config
            .validate()
            .map_err(GenerationError::model_load_failed)?;
        if !self.backend.is_available() {
            return Err(GenerationError::backend_unavailable(format!(
                "{} backend is not available",
                self.backend.name()
            )));
        }

        let path = self.config.resolved_model_path();
        let size_bytes = validate_model_file(&path, self.config.kind)?;
        if let Some(ref expected) = self.config.sha256 {
            verify_checksum_blocking(path.clone(), expected.clone()).await?;
        }
        tracing::info!(
            model = %path.display(),
            kind = %self.config.kind,
            size = %format_bytes(size_bytes),
            contexts = self.config.num_contexts,
            "Loading model"
        );

        let pool = ContextPool::with_close_grace(
            self.config.num_contexts,
            path.clone(),
            Arc::clone(&self.backend),
            self.config.close_grace(),
        )?;
        let client = InferenceClient::new(pool, ClientConfig::from(&self.config));

        let outcome = if self.config.startup_self_test_enabled {
            self.self_test(&client).await
        } else {
            SelfTestOutcome::skipped()
        };

        let failure = outcome.error.clone();
        self.store(describe(&path, self.config.kind, size_bytes, outcome));

        if let Some(reason) = failure {
            tracing::error!(model = %path.display(), "Startup self-test failed: {}", reason);
            client.close().await;
            return Err(GenerationError::model_load_failed(format!(
                "startup self-test failed for {}: {}",
                path.display(),
                reason
            )));
        }

        tracing::info!(model = %path.display(), "Model loaded");
        Ok(client)
    }

    async fn self_test(&self, client: &InferenceClient<B>) -> SelfTestOutcome {
        let started = Instant::now();
        let limit = self.config.self_test_timeout();

        let run = minimal_request(client, self.config.kind);
        let result = match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::timeout(format!(
                "self-test exceeded {:?}",
                limit
            ))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(duration_ms, "Startup self-test passed: {}", output);
                SelfTestOutcome {
                    status: SelfTestStatus::Passed,
                    duration_ms,
                    error: None,
                }
            }
            Err(err) => SelfTestOutcome {
                status: SelfTestStatus::Failed,
                duration_ms,
                error: Some(err.to_string()),
            },
        }
    }

    /// Metadata from the last `load` or `inspect`.
    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, metadata: ModelMetadata) {
        *self.metadata.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata);
    }
}

/// Smallest request that proves a model can serve its workload. Returns a
/// short description of the output for logs.
pub async fn minimal_request<B: Backend>(client: &InferenceClient<B>, kind: ModelKind) -> Result<String> {
    match kind {
        ModelKind::Language => client
            .infer(TextRequest::new("Hello").with_max_tokens(10))
            .await
            .map(|r| truncate_for_log(&r.text, 50)),
        ModelKind::Diffusion => client
            .generate(
                ImageRequest::new("test")
                    .with_size(128, 128)
                    .with_steps(1)
                    .with_seed(42),
            )
            .await
            .map(|r| format!("{} bytes", r.image_data.len())),
    }
}

fn describe(path: &Path, kind: ModelKind, size_bytes: u64, self_test: SelfTestOutcome) -> ModelMetadata {
    ModelMetadata {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path.display().to_string(),
        kind,
        size_bytes,
        size_human: format_bytes(size_bytes),
        loaded_at: Utc::now(),
        self_test,
    }
}

/// Check that `path` is a readable, non-empty model file and return its size.
pub fn validate_model_file(path: &Path, kind: ModelKind) -> Result<u64> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        GenerationError::model_not_found(format!("model file {}: {}", path.display(), e))
            .with_cause(e)
    })?;
    if !metadata.is_file() {
        return Err(GenerationError::model_not_found(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if metadata.len() == 0 {
        return Err(GenerationError::model_load_failed(format!(
            "model file {} is empty",
            path.display()
        )));
    }

    let mut file = File::open(path).map_err(|e| {
        GenerationError::model_load_failed(format!("cannot read {}: {}", path.display(), e))
            .with_cause(e)
    })?;

    if kind == ModelKind::Language {
        let mut magic = [0u8; 4];
        let header = file.read_exact(&mut magic);
        if header.is_err() || &magic != GGUF_MAGIC {
            return Err(GenerationError::model_load_failed(format!(
                "{} is not a GGUF model",
                path.display()
            )));
        }
    }

    Ok(metadata.len())
}

/// Lowercase hex SHA-256 of a file, streamed in chunks.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        GenerationError::model_not_found(format!("model file {}: {}", path.display(), e))
            .with_cause(e)
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| {
        GenerationError::model_load_failed(format!("cannot read {}: {}", path.display(), e))
            .with_cause(e)
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Fail with `ModelLoadFailed` unless the file hashes to `expected`.
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = file_sha256(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(GenerationError::model_load_failed(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected.trim().to_ascii_lowercase(),
            actual
        )));
    }
    tracing::debug!(model = %path.display(), sha256 = %actual, "Model checksum verified");
    Ok(())
}

async fn verify_checksum_blocking(path: PathBuf, expected: String) -> Result<()> {
    tokio::task::spawn_blocking(move || verify_checksum(&path, &expected))
        .await
        .map_err(|e| GenerationError::model_load_failed("checksum task panicked").with_cause(e))?
}

/// Render a byte count with one decimal place.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Cut `text` to at most `max` characters for log lines.
pub fn truncate_for_log(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
