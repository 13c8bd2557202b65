pub mod backend;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod loader;
pub mod logging;
pub mod pool;
pub mod recovery;
pub mod test_util;

pub use backend::{classify, Backend, BackendError, GpuMemory, NativeCode, NullBackend};
pub use client::{ClientConfig, ClientMetrics, InferenceClient};
pub use config::{Config, HealthConfig, ModelConfig, RecoveryConfig};
pub use engine::{BackendInfo, EngineRegistry, InferenceEngine, ModelInfo, ModelKind, NullEngine};
pub use error::{ErrorCode, GenerationError, Result};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use loader::{ModelLoader, ModelMetadata, SelfTestStatus};
pub use pool::{ContextPool, PoolStats, PooledContext, ResetOutcome};
pub use recovery::{RecoveryAction, RecoveryManager, RecoveryStats};
