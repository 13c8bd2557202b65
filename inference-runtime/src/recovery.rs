//! Retry and escalation around an inference client.
//!
//! Retryable failures walk an escalation ladder: plain retries with
//! exponential backoff, then discarding a context, then rebuilding the
//! whole client through the model loader. Non-retryable errors skip the
//! ladder and reach the caller on the first attempt.
//!
//! Ladder state is shared across requests, so failures that persist over
//! several requests still escalate.
//!
//! When a request still fails after the configured number of reloads, the
//! manager enters degraded mode and rejects requests up front. It leaves
//! degraded mode once a minimal request succeeds again, either through
//! [`RecoveryManager::try_recover`] or the task started by
//! [`RecoveryManager::spawn_recovery_loop`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inference_common::{ImageRequest, ImageResponse, TextRequest, TextResponse, VisionRequest};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, GpuMemory};
use crate::client::{ClientMetrics, InferenceClient};
use crate::config::RecoveryConfig;
use crate::engine::{BackendInfo, InferenceEngine, ModelInfo};
use crate::error::{GenerationError, Result};
use crate::loader::{minimal_request, ModelLoader};
use crate::pool::{PoolStats, ResetOutcome};

/// Action taken after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    ContextReset,
    ModelReload,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::Retry => write!(f, "retry"),
            RecoveryAction::ContextReset => write!(f, "context_reset"),
            RecoveryAction::ModelReload => write!(f, "model_reload"),
        }
    }
}

/// Failure counters the ladder decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LadderState {
    /// Retryable failures since the last success or escalation.
    pub consecutive_failures: u32,
    /// Context resets since the last success or reload.
    pub resets_since_recovery: u32,
}

/// One rung of the escalation ladder.
pub struct EscalationStep {
    pub action: RecoveryAction,
    pub eligible: fn(&LadderState, &RecoveryConfig) -> bool,
}

/// Rungs in priority order. The first eligible one fires; otherwise the
/// failure is a plain retry.
pub const ESCALATION_LADDER: [EscalationStep; 2] = [
    EscalationStep {
        action: RecoveryAction::ModelReload,
        eligible: reload_eligible,
    },
    EscalationStep {
        action: RecoveryAction::ContextReset,
        eligible: reset_eligible,
    },
];

fn reset_eligible(state: &LadderState, config: &RecoveryConfig) -> bool {
    config.context_reset_threshold > 0
        && state.consecutive_failures >= config.context_reset_threshold
}

fn reload_eligible(state: &LadderState, config: &RecoveryConfig) -> bool {
    reset_eligible(state, config)
        && config.model_reload_threshold > 0
        && state.resets_since_recovery >= config.model_reload_threshold
}

/// Pick the action for the current ladder state.
pub fn next_action(state: &LadderState, config: &RecoveryConfig) -> RecoveryAction {
    ESCALATION_LADDER
        .iter()
        .find(|step| (step.eligible)(state, config))
        .map(|step| step.action)
        .unwrap_or(RecoveryAction::Retry)
}

/// Delay before retry number `retry` (1-based), capped at the max backoff.
pub fn backoff_delay(config: &RecoveryConfig, retry: u32) -> Duration {
    let initial = config.initial_backoff().as_secs_f64();
    let exponent = retry.saturating_sub(1).min(63) as i32;
    let delay = initial * config.backoff_multiplier.max(1.0).powi(exponent);
    let max = config.max_backoff();
    if delay.is_finite() && delay < max.as_secs_f64() {
        Duration::from_secs_f64(delay)
    } else {
        max
    }
}

/// Cumulative recovery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_attempts: u64,
    pub context_resets: u64,
    pub model_reloads: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
    #[serde(default)]
    pub degraded_reason: Option<String>,
    #[serde(default)]
    pub degraded_since: Option<DateTime<Utc>>,
    pub degraded_entries: u64,
    pub degraded_exits: u64,
    #[serde(default)]
    pub last_action: Option<RecoveryAction>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
}

struct Degraded {
    reason: String,
    since: DateTime<Utc>,
}

#[derive(Default)]
struct LadderTracker {
    state: LadderState,
    /// Reload attempts since the last successful request.
    reloads_since_success: u32,
    degraded: Option<Degraded>,
    last_action: Option<RecoveryAction>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

/// Wraps the current client and applies the escalation ladder.
pub struct RecoveryManager<B: Backend> {
    loader: ModelLoader<B>,
    config: RecoveryConfig,
    client: RwLock<Arc<InferenceClient<B>>>,
    ladder: Mutex<LadderTracker>,
    reload_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    retry_attempts: AtomicU64,
    context_resets: AtomicU64,
    model_reloads: AtomicU64,
    degraded_entries: AtomicU64,
    degraded_exits: AtomicU64,
}

impl<B: Backend> RecoveryManager<B> {
    /// Wrap an already loaded client. `loader` rebuilds it on reload.
    pub fn new(loader: ModelLoader<B>, client: InferenceClient<B>, config: RecoveryConfig) -> Self {
        Self {
            loader,
            config,
            client: RwLock::new(Arc::new(client)),
            ladder: Mutex::new(LadderTracker::default()),
            reload_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
            context_resets: AtomicU64::new(0),
            model_reloads: AtomicU64::new(0),
            degraded_entries: AtomicU64::new(0),
            degraded_exits: AtomicU64::new(0),
        }
    }

    /// Load the model through `loader` and wrap the result.
    pub async fn start(loader: ModelLoader<B>, config: RecoveryConfig) -> Result<Self> {
        let client = loader.load().await?;
        Ok(Self::new(loader, client, config))
    }

    /// The client currently serving requests.
    pub fn client(&self) -> Arc<InferenceClient<B>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn loader(&self) -> &ModelLoader<B> {
        &self.loader
    }

    fn ladder(&self) -> MutexGuard<'_, LadderTracker> {
        self.ladder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `attempt` against the current client until it succeeds, fails
    /// with a non-retryable error, or retries run out.
    pub async fn execute<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut(Arc<InferenceClient<B>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = self.degraded_reason() {
            self.record_failure();
            return Err(GenerationError::backend_unavailable(format!(
                "service in degraded mode: {}",
                reason
            )));
        }
        let mut retries = 0u32;

        loop {
            let err = match attempt(self.client()).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.retryable {
                self.record_failure();
                return Err(err);
            }

            let action = self.record_retryable_failure();
            self.apply(action).await;

            if retries >= self.config.max_retries || self.closed.load(Ordering::SeqCst) {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    operation,
                    retries,
                    code = %err.code,
                    "Giving up after retries: {}",
                    err.message
                );
                self.check_degraded(&err);
                return Err(err);
            }

            retries += 1;
            self.retry_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = backoff_delay(&self.config, retries);
            tracing::warn!(
                operation,
                attempt = retries,
                max_retries = self.config.max_retries,
                %action,
                ?delay,
                "Retrying after {}: {}",
                err.code,
                err.message
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn record_success(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        let mut ladder = self.ladder();
        ladder.state = LadderState::default();
        ladder.reloads_since_success = 0;
        ladder.last_success = Some(Utc::now());
    }

    fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.ladder().last_failure = Some(Utc::now());
    }

    /// Enter degraded mode if reloads have run out for this failure.
    fn check_degraded(&self, err: &GenerationError) {
        let limit = self.config.max_model_reloads;
        if !self.config.degraded_mode_enabled || limit == 0 {
            return;
        }
        let mut ladder = self.ladder();
        if ladder.degraded.is_some() || ladder.reloads_since_success < limit {
            return;
        }
        let reason = format!(
            "{} model reloads did not recover: {}",
            ladder.reloads_since_success, err
        );
        tracing::error!("Entering degraded mode: {}", reason);
        ladder.degraded = Some(Degraded {
            reason,
            since: Utc::now(),
        });
        self.degraded_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn exit_degraded(&self) {
        let mut ladder = self.ladder();
        if ladder.degraded.take().is_some() {
            ladder.state = LadderState::default();
            ladder.reloads_since_success = 0;
            self.degraded_exits.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Leaving degraded mode, service recovered");
        }
    }

    /// Why the manager is rejecting requests, if it is.
    pub fn degraded_reason(&self) -> Option<String> {
        self.ladder().degraded.as_ref().map(|d| d.reason.clone())
    }

    pub fn is_degraded(&self) -> bool {
        self.ladder().degraded.is_some()
    }

    /// Try to leave degraded mode.
    ///
    /// Runs a minimal request on the current client. If that fails, the
    /// model is reloaded and checked again. Returns `Ok` once the manager
    /// is serving normally, including when it was never degraded.
    pub async fn try_recover(&self) -> Result<()> {
        if !self.is_degraded() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(GenerationError::pool_closed());
        }
        tracing::info!("Attempting recovery from degraded mode");

        let kind = self.loader.config().kind;
        let first = minimal_request(&self.client(), kind).await;
        let checked = match first {
            Ok(output) => Ok(output),
            Err(err) => {
                tracing::warn!("Degraded check failed, reloading model: {}", err);
                self.reload().await?;
                minimal_request(&self.client(), kind).await
            }
        };

        match checked {
            Ok(_) => {
                self.exit_degraded();
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Still degraded: {}", err);
                Err(err)
            }
        }
    }

    /// Periodically call [`try_recover`](Self::try_recover) while degraded.
    ///
    /// The task holds a weak reference and stops once the manager is
    /// dropped or closed.
    pub fn spawn_recovery_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.degraded_recovery_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.closed.load(Ordering::SeqCst) {
                    break;
                }
                if manager.is_degraded() {
                    // Failures are logged inside; the next tick tries again.
                    let _ = manager.try_recover().await;
                }
            }
            tracing::debug!("Degraded-mode recovery loop stopped");
        })
    }

    /// Count a retryable failure and decide what to do about it.
    ///
    /// The decision and its counter updates happen under one lock, so two
    /// concurrent failures never both trigger the same escalation.
    fn record_retryable_failure(&self) -> RecoveryAction {
        let mut ladder = self.ladder();
        ladder.last_failure = Some(Utc::now());
        ladder.state.consecutive_failures += 1;

        let action = next_action(&ladder.state, &self.config);
        match action {
            RecoveryAction::Retry => {}
            RecoveryAction::ContextReset => {
                ladder.state.consecutive_failures = 0;
                ladder.state.resets_since_recovery += 1;
            }
            RecoveryAction::ModelReload => {
                ladder.state = LadderState::default();
            }
        }
        ladder.last_action = Some(action);
        action
    }

    async fn apply(&self, action: RecoveryAction) {
        match action {
            RecoveryAction::Retry => {}
            RecoveryAction::ContextReset => {
                let outcome = self.client().pool().reset_one().await;
                self.context_resets.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(?outcome, "Escalated to context reset");
                if outcome == ResetOutcome::Nothing {
                    tracing::debug!("No live context to reset");
                }
            }
            RecoveryAction::ModelReload => {
                tracing::warn!("Escalated to model reload");
                if let Err(err) = self.reload().await {
                    tracing::error!("Model reload failed: {}", err);
                }
            }
        }
    }

    /// Build a fresh client and swap it in. The old client closes in the
    /// background so in-flight calls on it can finish.
    pub async fn reload(&self) -> Result<()> {
        let _reloading = self.reload_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(GenerationError::pool_closed());
        }
        self.ladder().reloads_since_success += 1;

        let fresh = Arc::new(self.loader.load().await?);
        let previous = {
            let mut current = self.client.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, fresh)
        };
        self.model_reloads.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            model = %self.loader.config().model_path,
            reloads = self.model_reloads.load(Ordering::Relaxed),
            "Model reloaded"
        );

        tokio::spawn(async move {
            previous.close().await;
        });
        Ok(())
    }

    pub fn stats(&self) -> RecoveryStats {
        let ladder = self.ladder();
        RecoveryStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            context_resets: self.context_resets.load(Ordering::Relaxed),
            model_reloads: self.model_reloads.load(Ordering::Relaxed),
            consecutive_failures: ladder.state.consecutive_failures,
            degraded: ladder.degraded.is_some(),
            degraded_reason: ladder.degraded.as_ref().map(|d| d.reason.clone()),
            degraded_since: ladder.degraded.as_ref().map(|d| d.since),
            degraded_entries: self.degraded_entries.load(Ordering::Relaxed),
            degraded_exits: self.degraded_exits.load(Ordering::Relaxed),
            last_action: ladder.last_action,
            last_success: ladder.last_success,
            last_failure: ladder.last_failure,
        }
    }

    /// Close the current client. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out any reload so its client is the one closed.
        let _reloading = self.reload_lock.lock().await;
        self.client().close().await;
    }
}

#[async_trait]
impl<B: Backend> InferenceEngine for RecoveryManager<B> {
    fn engine_type(&self) -> &'static str {
        "recovering"
    }

    async fn infer(&self, request: TextRequest) -> Result<TextResponse> {
        self.execute("text inference", |client| {
            let request = request.clone();
            async move { client.infer(request).await }
        })
        .await
    }

    async fn infer_vision(&self, request: VisionRequest) -> Result<TextResponse> {
        self.execute("vision inference", |client| {
            let request = request.clone();
            async move { client.infer_vision(request).await }
        })
        .await
    }

    async fn generate(&self, request: ImageRequest) -> Result<ImageResponse> {
        self.execute("image generation", |client| {
            let request = request.clone();
            async move { client.generate(request).await }
        })
        .await
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client().is_ready()
    }

    fn model_info(&self) -> Option<ModelInfo> {
        let mut info = self.client().model_info();
        info.loaded = self.is_ready();
        Some(info)
    }

    fn backend_info(&self) -> BackendInfo {
        self.client().backend_info()
    }

    fn metrics(&self) -> ClientMetrics {
        self.client().metrics()
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(self.client().pool().stats())
    }

    fn recovery_stats(&self) -> Option<RecoveryStats> {
        Some(self.stats())
    }

    fn gpu_memory(&self) -> Option<GpuMemory> {
        self.client().pool().backend().gpu_memory()
    }

    async fn close(&self) {
        RecoveryManager::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> RecoveryConfig {
        RecoveryConfig::default()
    }

    #[rstest]
    #[case(0, 0, RecoveryAction::Retry)]
    #[case(2, 0, RecoveryAction::Retry)]
    #[case(3, 0, RecoveryAction::ContextReset)]
    #[case(7, 1, RecoveryAction::ContextReset)]
    #[case(3, 2, RecoveryAction::ModelReload)]
    #[case(2, 9, RecoveryAction::Retry)]
    fn test_ladder_with_default_thresholds(
        #[case] consecutive_failures: u32,
        #[case] resets_since_recovery: u32,
        #[case] expected: RecoveryAction,
    ) {
        let state = LadderState {
            consecutive_failures,
            resets_since_recovery,
        };
        assert_eq!(next_action(&state, &config()), expected);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(10));
        assert_eq!(backoff_delay(&config, 500), Duration::from_secs(10));
    }

    #[test]
    fn test_plain_retry_below_threshold() {
        let state = LadderState {
            consecutive_failures: 2,
            resets_since_recovery: 0,
        };
        assert_eq!(next_action(&state, &config()), RecoveryAction::Retry);
    }

    #[test]
    fn test_reset_at_threshold() {
        let state = LadderState {
            consecutive_failures: 3,
            resets_since_recovery: 1,
        };
        assert_eq!(next_action(&state, &config()), RecoveryAction::ContextReset);
    }

    #[test]
    fn test_reload_after_repeated_resets() {
        let state = LadderState {
            consecutive_failures: 3,
            resets_since_recovery: 2,
        };
        assert_eq!(next_action(&state, &config()), RecoveryAction::ModelReload);
    }

    #[test]
    fn test_reload_needs_persisting_failures() {
        // Enough resets, but failures have not piled up again yet.
        let state = LadderState {
            consecutive_failures: 1,
            resets_since_recovery: 5,
        };
        assert_eq!(next_action(&state, &config()), RecoveryAction::Retry);
    }

    #[test]
    fn test_zero_thresholds_disable_rungs() {
        let config = RecoveryConfig {
            context_reset_threshold: 0,
            ..config()
        };
        let state = LadderState {
            consecutive_failures: 50,
            resets_since_recovery: 50,
        };
        assert_eq!(next_action(&state, &config), RecoveryAction::Retry);

        let config = RecoveryConfig {
            model_reload_threshold: 0,
            ..RecoveryConfig::default()
        };
        assert_eq!(next_action(&state, &config), RecoveryAction::ContextReset);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = RecoveryStats {
            retry_attempts: 2,
            last_action: Some(RecoveryAction::ContextReset),
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["retry_attempts"], 2);
        assert_eq!(json["last_action"], "context_reset");
        assert_eq!(json["degraded"], false);
        assert!(json["degraded_reason"].is_null());
    }
}
