//! Pooled inference client.
//!
//! Every request follows the same path: validate, acquire a context under
//! the acquire timeout, run the native call on the blocking pool under the
//! generation timeout, release, classify, record metrics.
//!
//! Native calls cannot be interrupted. When the generation deadline passes
//! the caller gets `Timeout` immediately, but the call keeps running on its
//! blocking thread and its context only goes back to the pool when the call
//! returns. The same holds when the caller's future is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use inference_common::{
    ImageRequest, ImageResponse, StopReason, TextRequest, TextResponse, ValidationError,
    VisionRequest,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backend::{classify, Backend, BackendResult, GpuMemory};
use crate::config::ModelConfig;
use crate::engine::{BackendInfo, InferenceEngine, ModelInfo, ModelKind};
use crate::error::{ErrorCode, GenerationError, Result};
use crate::pool::{ContextPool, PoolStats};

/// Timeouts applied to each request.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub kind: ModelKind,
    pub acquire_timeout: Duration,
    pub generation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Language,
            acquire_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ModelConfig> for ClientConfig {
    fn from(config: &ModelConfig) -> Self {
        Self {
            kind: config.kind,
            acquire_timeout: config.acquire_timeout(),
            generation_timeout: config.generation_timeout(),
        }
    }
}

/// Snapshot of a client's request counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    /// Requests that passed validation.
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Requests rejected by validation. Not counted as failures.
    pub rejected_requests: u64,
    pub timeouts: u64,
    /// Summed over successful requests.
    pub total_duration_ms: u64,
    pub average_duration_ms: f64,
    pub tokens_generated: u64,
    pub average_tokens_per_second: f64,
    /// Contexts checked out right now.
    pub queue_depth: usize,
    pub active_generations: usize,
}

impl ClientMetrics {
    /// Failures over admitted requests, or 0 with no requests.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Default)]
struct MetricsRecorder {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
    duration_ms: AtomicU64,
    tokens: AtomicU64,
}

impl MetricsRecorder {
    fn record_success(&self, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.duration_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, err: &GenerationError) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        if err.code == ErrorCode::Timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tokens(&self, tokens: u32) {
        self.tokens.fetch_add(u64::from(tokens), Ordering::Relaxed);
    }

    fn snapshot(&self, in_flight: usize) -> ClientMetrics {
        let successes = self.successes.load(Ordering::Relaxed);
        let duration_ms = self.duration_ms.load(Ordering::Relaxed);
        let tokens = self.tokens.load(Ordering::Relaxed);
        ClientMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: successes,
            failed_requests: self.failures.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_duration_ms: duration_ms,
            average_duration_ms: if successes == 0 {
                0.0
            } else {
                duration_ms as f64 / successes as f64
            },
            tokens_generated: tokens,
            average_tokens_per_second: if duration_ms == 0 {
                0.0
            } else {
                tokens as f64 / (duration_ms as f64 / 1000.0)
            },
            queue_depth: in_flight,
            active_generations: in_flight,
        }
    }
}

/// Serves requests for one model through a bounded context pool.
pub struct InferenceClient<B: Backend> {
    pool: ContextPool<B>,
    config: ClientConfig,
    model: ModelInfo,
    metrics: MetricsRecorder,
    closed: AtomicBool,
}

impl<B: Backend> InferenceClient<B> {
    pub fn new(pool: ContextPool<B>, config: ClientConfig) -> Self {
        let model = ModelInfo::describe(pool.model_path(), config.kind, pool.capacity());
        Self {
            pool,
            config,
            model,
            metrics: MetricsRecorder::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &ContextPool<B> {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Text completion.
    pub async fn infer(&self, request: TextRequest) -> Result<TextResponse> {
        self.admit(request.validate())?;
        let max_tokens = request.max_tokens;

        let (output, elapsed) = self
            .execute("text inference", move |backend, context| {
                backend.infer_text(context, &request)
            })
            .await?;

        self.metrics.record_tokens(output.tokens_generated);
        Ok(TextResponse {
            text: output.text,
            prompt_tokens: output.prompt_tokens,
            tokens_generated: output.tokens_generated,
            duration_ms: elapsed.as_millis() as u64,
            tokens_per_second: tokens_per_second(output.tokens_generated, elapsed),
            stop_reason: output.stop_reason.unwrap_or(if output.tokens_generated >= max_tokens {
                StopReason::Length
            } else {
                StopReason::Stop
            }),
        })
    }

    /// Text completion about an image.
    ///
    /// The native call returns only text, so token counts are estimated at
    /// four bytes per token.
    pub async fn infer_vision(&self, request: VisionRequest) -> Result<TextResponse> {
        self.admit(request.validate())?;
        let prompt_tokens = estimate_tokens(&request.prompt);
        let max_tokens = request.max_tokens;

        let (text, elapsed) = self
            .execute("vision inference", move |backend, context| {
                backend.infer_vision(context, &request)
            })
            .await?;

        let tokens_generated = estimate_tokens(&text);
        self.metrics.record_tokens(tokens_generated);
        Ok(TextResponse {
            text,
            prompt_tokens,
            tokens_generated,
            duration_ms: elapsed.as_millis() as u64,
            tokens_per_second: tokens_per_second(tokens_generated, elapsed),
            stop_reason: if tokens_generated >= max_tokens {
                StopReason::Length
            } else {
                StopReason::Stop
            },
        })
    }

    /// Image generation. A seed of `-1` is replaced with a random one.
    pub async fn generate(&self, request: ImageRequest) -> Result<ImageResponse> {
        self.admit(request.validate())?;
        let seed = if request.wants_random_seed() {
            random_seed()
        } else {
            request.seed
        };
        let steps = request.steps;

        let (output, elapsed) = self
            .execute("image generation", move |backend, context| {
                backend.generate_image(context, &request, seed)
            })
            .await?;

        Ok(ImageResponse {
            image_data: output.data,
            format: output.format,
            width: output.width,
            height: output.height,
            seed,
            steps,
            duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// Reject invalid requests, then closed clients, before touching the pool.
    fn admit(&self, validation: std::result::Result<(), ValidationError>) -> Result<()> {
        validation.map_err(|e| {
            self.metrics.record_rejected();
            GenerationError::from(e)
        })?;
        if self.is_closed() {
            return Err(GenerationError::pool_closed());
        }
        Ok(())
    }

    async fn execute<T, F>(&self, operation: &'static str, call: F) -> Result<(T, Duration)>
    where
        T: Send + 'static,
        F: FnOnce(&B, &mut B::Context) -> BackendResult<T> + Send + 'static,
    {
        let context = match self.pool.acquire(self.config.acquire_timeout).await {
            Ok(context) => context,
            Err(err) => {
                self.metrics.record_failure(&err);
                return Err(err);
            }
        };

        let backend = Arc::clone(self.pool.backend());
        let deadline = self.config.generation_timeout;
        let started = Instant::now();

        // The guard moves onto the blocking thread and is released there,
        // after the native call returns.
        let task = tokio::task::spawn_blocking(move || {
            let mut context = context;
            context.mark_blocking_thread();
            let result = call(backend.as_ref(), context.handle_mut());
            if let Err(ref err) = result {
                if err.corrupts_context() {
                    context.mark_broken();
                } else {
                    context.mark_failed();
                }
            }
            result
        });

        let outcome = tokio::time::timeout(deadline, task).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Err(_) => Err(GenerationError::timeout(format!(
                "{} exceeded {:?}",
                operation, deadline
            ))),
            Ok(Err(join_err)) => Err(GenerationError::generation_failed(format!(
                "{} panicked in the native backend",
                operation
            ))
            .with_cause(join_err)),
            Ok(Ok(_)) if elapsed >= deadline => Err(GenerationError::timeout(format!(
                "{} exceeded {:?}",
                operation, deadline
            ))),
            Ok(Ok(Err(err))) => Err(classify(err)),
            Ok(Ok(Ok(value))) => Ok(value),
        };

        match result {
            Ok(value) => {
                self.metrics.record_success(elapsed);
                tracing::debug!(operation, ?elapsed, "Native call completed");
                Ok((value, elapsed))
            }
            Err(err) => {
                self.metrics.record_failure(&err);
                tracing::warn!(
                    operation,
                    code = %err.code,
                    retryable = err.retryable,
                    ?elapsed,
                    "Native call failed: {}",
                    err.message
                );
                Err(err)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.is_closed() && !self.pool.is_closed() && self.pool.backend().is_available()
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            loaded: self.is_ready(),
            ..self.model.clone()
        }
    }

    pub fn backend_info(&self) -> BackendInfo {
        let backend = self.pool.backend();
        BackendInfo {
            name: backend.name().to_string(),
            available: backend.is_available() && !self.is_closed(),
            device: backend.device_name(),
        }
    }

    pub fn metrics(&self) -> ClientMetrics {
        self.metrics.snapshot(self.pool.in_use())
    }

    /// Close the client and its pool. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
        tracing::info!("Closed inference client for {}", self.model.name);
    }
}

#[async_trait]
impl<B: Backend> InferenceEngine for InferenceClient<B> {
    fn engine_type(&self) -> &'static str {
        "pooled"
    }

    async fn infer(&self, request: TextRequest) -> Result<TextResponse> {
        InferenceClient::infer(self, request).await
    }

    async fn infer_vision(&self, request: VisionRequest) -> Result<TextResponse> {
        InferenceClient::infer_vision(self, request).await
    }

    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse> {
        InferenceClient::generate(self, request).await
    }

    fn is_ready(&self) -> bool {
        InferenceClient::is_ready(self)
    }

    fn model_info(&self) -> Option<ModelInfo> {
        Some(InferenceClient::model_info(self))
    }

    fn backend_info(&self) -> BackendInfo {
        InferenceClient::backend_info(self)
    }

    fn metrics(&self) -> ClientMetrics {
        InferenceClient::metrics(self)
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.pool.stats())
    }

    fn gpu_memory(&self) -> Option<GpuMemory> {
        self.pool.backend().gpu_memory()
    }

    async fn close(&self) {
        InferenceClient::close(self).await
    }
}

fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

fn tokens_per_second(tokens: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        f64::from(tokens) / secs
    } else {
        0.0
    }
}

/// Non-negative seed for requests that ask for a random one.
fn random_seed() -> i64 {
    rand::thread_rng().gen_range(0..i64::MAX)
}
