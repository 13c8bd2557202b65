use std::sync::Arc;
use std::time::Duration;

use inference_common::{ImageRequest, TextRequest};
use inference_runtime::backend::{BackendError, NativeCode};
use inference_runtime::test_util::{
    diffusion_model_file, model_file, test_model_config, wait_until, ScriptedBackend,
};
use inference_runtime::{
    ErrorCode, InferenceEngine, ModelKind, ModelLoader, RecoveryAction, RecoveryConfig,
    RecoveryManager,
};
use tempfile::NamedTempFile;

fn oom() -> BackendError {
    BackendError::message("CUDA error: out of memory")
}

fn fast_recovery(context_reset_threshold: u32, model_reload_threshold: u32) -> RecoveryConfig {
    RecoveryConfig {
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        context_reset_threshold,
        model_reload_threshold,
        ..RecoveryConfig::default()
    }
}

async fn manager(
    recovery: RecoveryConfig,
) -> (RecoveryManager<ScriptedBackend>, Arc<ScriptedBackend>, NamedTempFile) {
    let file = model_file();
    let backend = Arc::new(ScriptedBackend::new());
    let loader = ModelLoader::new(
        Arc::clone(&backend),
        test_model_config(&file, ModelKind::Language),
    );
    let manager = RecoveryManager::start(loader, recovery).await.unwrap();
    (manager, backend, file)
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (manager, backend, _file) = manager(fast_recovery(3, 2)).await;
    backend.fail_times(2, oom());

    let response = manager.infer(TextRequest::new("Hello")).await.unwrap();
    assert_eq!(response.text, "echo: Hello");

    let stats = manager.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.retry_attempts, 2);
    assert_eq!(stats.context_resets, 0);
    assert_eq!(stats.model_reloads, 0);
    assert_eq!(stats.consecutive_failures, 0);
    assert!(stats.last_success.is_some());
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_non_retryable_error_surfaces_immediately() {
    let (manager, backend, _file) = manager(fast_recovery(3, 2)).await;
    backend.fail_times(
        1,
        BackendError::new(NativeCode::InvalidInput, "prompt too long for context"),
    );

    let err = manager.infer(TextRequest::new("Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    assert!(!err.retryable);

    let stats = manager.stats();
    assert_eq!(stats.retry_attempts, 0);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_validation_failure_never_retries() {
    let (manager, backend, _file) = manager(fast_recovery(3, 2)).await;

    let err = manager
        .infer(TextRequest::new("Hello").with_max_tokens(0))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    assert_eq!(manager.stats().retry_attempts, 0);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_gives_up_with_last_error() {
    let (manager, backend, _file) = manager(RecoveryConfig {
        max_retries: 2,
        ..fast_recovery(0, 0)
    })
    .await;
    backend.fail_times(10, oom());

    let err = manager.infer(TextRequest::new("Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::OutOfMemory);
    assert!(err.retryable);

    let stats = manager.stats();
    assert_eq!(stats.retry_attempts, 2);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.successful_requests, 0);
    assert!(stats.last_failure.is_some());
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_context_reset_after_threshold() {
    let (manager, backend, _file) = manager(fast_recovery(2, 0)).await;
    backend.fail_times(3, oom());

    manager.infer(TextRequest::new("Hello")).await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.retry_attempts, 3);
    assert_eq!(stats.context_resets, 1);
    assert_eq!(stats.model_reloads, 0);
    // The idle context was discarded and a fresh one served the request.
    assert_eq!(backend.contexts_destroyed(), 1);
    assert_eq!(backend.contexts_created(), 2);
}

#[tokio::test]
async fn test_model_reload_after_repeated_resets() {
    let (manager, backend, _file) = manager(fast_recovery(1, 2)).await;
    let original = manager.client();
    backend.fail_times(3, oom());

    manager.infer(TextRequest::new("Hello")).await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.context_resets, 2);
    assert_eq!(stats.model_reloads, 1);
    assert_eq!(stats.retry_attempts, 3);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.last_action, Some(RecoveryAction::ModelReload));

    let current = manager.client();
    assert!(!Arc::ptr_eq(&original, &current));
    assert!(current.is_ready());
    assert!(wait_until(Duration::from_secs(2), || original.is_closed()).await);
}

#[tokio::test]
async fn test_failures_escalate_across_requests() {
    let (manager, backend, _file) = manager(RecoveryConfig {
        max_retries: 0,
        ..fast_recovery(2, 0)
    })
    .await;
    backend.fail_times(2, oom());

    assert!(manager.infer(TextRequest::new("one")).await.is_err());
    assert_eq!(manager.stats().consecutive_failures, 1);
    assert!(manager.infer(TextRequest::new("two")).await.is_err());

    let stats = manager.stats();
    assert_eq!(stats.context_resets, 1);
    assert_eq!(stats.retry_attempts, 0);
    assert_eq!(stats.failed_requests, 2);
}

#[tokio::test]
async fn test_image_generation_is_retried() {
    let file = diffusion_model_file();
    let backend = Arc::new(ScriptedBackend::new());
    let loader = ModelLoader::new(
        Arc::clone(&backend),
        test_model_config(&file, ModelKind::Diffusion),
    );
    let manager = RecoveryManager::start(loader, fast_recovery(3, 2))
        .await
        .unwrap();
    backend.fail_times(1, BackendError::new(NativeCode::OutOfMemory, "VRAM exhausted"));

    let response = manager
        .generate(ImageRequest::new("a lighthouse").with_seed(7))
        .await
        .unwrap();
    assert_eq!(response.seed, 7);
    assert_eq!(manager.stats().retry_attempts, 1);
}

#[tokio::test]
async fn test_close_releases_client() {
    let (manager, _backend, _file) = manager(fast_recovery(3, 2)).await;
    assert!(manager.is_ready());
    assert!(manager.recovery_stats().is_some());

    manager.close().await;
    manager.close().await;
    assert!(!manager.is_ready());
    assert!(manager.client().is_closed());

    let err = manager.infer(TextRequest::new("Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PoolClosed);
    assert_eq!(manager.stats().retry_attempts, 0);
}

#[tokio::test]
async fn test_reload_after_close_is_refused() {
    let (manager, _backend, _file) = manager(fast_recovery(3, 2)).await;
    manager.close().await;
    let err = manager.reload().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PoolClosed);
}

#[tokio::test]
async fn test_exhausted_reloads_enter_degraded_mode() {
    let (manager, backend, _file) = manager(RecoveryConfig {
        max_model_reloads: 2,
        ..fast_recovery(1, 1)
    })
    .await;
    // Reset, reload, reset, reload: every attempt fails.
    backend.fail_times(4, oom());

    let err = manager.infer(TextRequest::new("Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::OutOfMemory);

    let stats = manager.stats();
    assert_eq!(stats.model_reloads, 2);
    assert!(stats.degraded);
    assert_eq!(stats.degraded_entries, 1);
    assert!(stats.degraded_since.is_some());
    assert!(stats.degraded_reason.unwrap().contains("out of memory"));

    // Degraded requests are rejected without touching the backend.
    let calls = backend.calls();
    let err = manager.infer(TextRequest::new("Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BackendUnavailable);
    assert!(!err.retryable);
    assert!(err.message.contains("degraded"));
    assert_eq!(backend.calls(), calls);

    manager.try_recover().await.unwrap();
    let stats = manager.stats();
    assert!(!stats.degraded);
    assert_eq!(stats.degraded_exits, 1);
    assert!(manager.infer(TextRequest::new("Hello")).await.is_ok());
}

#[tokio::test]
async fn test_degraded_mode_can_be_disabled() {
    let (manager, backend, _file) = manager(RecoveryConfig {
        degraded_mode_enabled: false,
        ..fast_recovery(1, 1)
    })
    .await;
    backend.fail_times(4, oom());

    assert!(manager.infer(TextRequest::new("Hello")).await.is_err());
    assert!(!manager.is_degraded());
    assert!(manager.infer(TextRequest::new("Hello")).await.is_ok());
}

#[tokio::test]
async fn test_recovery_loop_leaves_degraded_mode() {
    let (manager, backend, _file) = manager(RecoveryConfig {
        max_model_reloads: 1,
        degraded_recovery_interval_secs: 1,
        ..fast_recovery(1, 1)
    })
    .await;
    backend.fail_times(4, oom());
    assert!(manager.infer(TextRequest::new("Hello")).await.is_err());
    assert!(manager.is_degraded());

    let manager = Arc::new(manager);
    let task = manager.spawn_recovery_loop();
    let watched = Arc::clone(&manager);
    assert!(wait_until(Duration::from_secs(5), || !watched.is_degraded()).await);
    assert_eq!(manager.stats().degraded_exits, 1);

    manager.close().await;
    task.abort();
}
