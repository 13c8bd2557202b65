//! Health snapshots for an inference engine.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::GpuMemory;
use crate::client::ClientMetrics;
use crate::config::HealthConfig;
use crate::engine::{BackendInfo, InferenceEngine, ModelInfo};
use crate::pool::PoolStats;
use crate::recovery::RecoveryStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but failing too often, short on GPU memory, or rejecting
    /// requests until recovery succeeds.
    Degraded,
    Unhealthy,
    /// No native backend on this platform.
    Unavailable,
}

/// Headline counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_inferences: u64,
    pub average_tokens_per_second: f64,
    pub error_count: u64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub status: HealthStatus,
    pub model_loaded: bool,
    /// Seconds since the serving model was loaded. Falls back to the
    /// monitor's age for engines without a loaded model.
    pub uptime: u64,
    pub checked_at: DateTime<Utc>,
    pub stats: HealthStats,
    pub metrics: ClientMetrics,
    #[serde(default)]
    pub pool: Option<PoolStats>,
    #[serde(default)]
    pub recovery: Option<RecoveryStats>,
    #[serde(default)]
    pub model: Option<ModelInfo>,
    pub backend: BackendInfo,
    #[serde(default)]
    pub gpu: Option<GpuMemory>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Builds health snapshots for one engine.
pub struct HealthMonitor {
    engine: Arc<dyn InferenceEngine>,
    config: HealthConfig,
    started_at: Instant,
}

impl HealthMonitor {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: HealthConfig) -> Self {
        Self {
            engine,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub fn health_check(&self) -> HealthSnapshot {
        let metrics = self.engine.metrics();
        let recovery = self.engine.recovery_stats();
        let pool = self.engine.pool_stats();
        let model = self.engine.model_info();
        let backend = self.engine.backend_info();
        let gpu = self.engine.gpu_memory();

        let model_loaded = model.as_ref().map(|m| m.loaded).unwrap_or(false);
        let ready = self.engine.is_ready();
        let pool_open = pool.as_ref().map(|p| !p.closed).unwrap_or(true);

        // Recovery stats see whole requests; client metrics see attempts.
        let (attempts, failures) = match &recovery {
            Some(r) => (r.total_requests, r.failed_requests),
            None => (metrics.total_requests, metrics.failed_requests),
        };
        let failure_rate = if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        };
        let counted = attempts >= self.config.min_samples;
        let failing = counted && failure_rate >= self.config.max_failure_rate;

        let degraded_mode = recovery.as_ref().filter(|r| r.degraded);

        let mut issues = Vec::new();
        if !backend.available {
            issues.push(format!("{} backend is not available", backend.name));
        }
        if !model_loaded {
            issues.push("model is not loaded".to_string());
        }
        if !pool_open {
            issues.push("context pool is closed".to_string());
        }
        if failing {
            issues.push(format!(
                "failure rate {:.1}% over {} requests exceeds {:.1}%",
                failure_rate * 100.0,
                attempts,
                self.config.max_failure_rate * 100.0
            ));
        }
        if let Some(r) = degraded_mode {
            issues.push(format!(
                "degraded mode: {}",
                r.degraded_reason.as_deref().unwrap_or("recovery exhausted")
            ));
        }
        let low_vram = gpu
            .map(|g| g.free_bytes < self.config.min_free_vram_bytes)
            .unwrap_or(false);
        if let Some(g) = gpu.filter(|_| low_vram) {
            issues.push(format!(
                "free GPU memory {} bytes is below {} bytes",
                g.free_bytes, self.config.min_free_vram_bytes
            ));
        }

        let healthy = model_loaded && ready && pool_open && !failing && degraded_mode.is_none();
        let status = if healthy && !low_vram {
            HealthStatus::Healthy
        } else if model_loaded && ready && pool_open {
            HealthStatus::Degraded
        } else if model.is_none() && !backend.available {
            HealthStatus::Unavailable
        } else {
            HealthStatus::Unhealthy
        };

        if !issues.is_empty() {
            tracing::debug!(?status, "Health issues: {}", issues.join("; "));
        }

        let uptime = match (&pool, &model) {
            (Some(p), _) => p.uptime_secs,
            (None, Some(m)) => (Utc::now() - m.loaded_at).num_seconds().max(0) as u64,
            (None, None) => self.started_at.elapsed().as_secs(),
        };

        HealthSnapshot {
            healthy,
            status,
            model_loaded,
            uptime,
            checked_at: Utc::now(),
            stats: HealthStats {
                total_inferences: metrics.successful_requests,
                average_tokens_per_second: metrics.average_tokens_per_second,
                error_count: failures,
                failure_rate: if counted { failure_rate } else { 0.0 },
            },
            metrics,
            pool,
            recovery,
            model,
            backend,
            gpu,
            issues,
        }
    }
}
