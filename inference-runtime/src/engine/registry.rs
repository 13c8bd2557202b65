//! Engine registry keyed by workload.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{InferenceEngine, ModelKind};

/// Registry of the engines serving each workload.
///
/// One engine per model kind; registering a kind again replaces it.
pub struct EngineRegistry {
    engines: RwLock<HashMap<ModelKind, Arc<dyn InferenceEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Register an engine, returning the one it replaced.
    pub async fn register(
        &self,
        kind: ModelKind,
        engine: Arc<dyn InferenceEngine>,
    ) -> Option<Arc<dyn InferenceEngine>> {
        let mut engines = self.engines.write().await;
        engines.insert(kind, engine)
    }

    pub async fn get(&self, kind: ModelKind) -> Option<Arc<dyn InferenceEngine>> {
        let engines = self.engines.read().await;
        engines.get(&kind).cloned()
    }

    /// All registered engines with their kinds.
    pub async fn all(&self) -> Vec<(ModelKind, Arc<dyn InferenceEngine>)> {
        let engines = self.engines.read().await;
        engines.iter().map(|(k, e)| (*k, e.clone())).collect()
    }

    /// Close and remove every engine.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut engines = self.engines.write().await;
            engines.drain().collect()
        };
        for (kind, engine) in drained {
            tracing::info!("Closing {} engine ({})", kind, engine.engine_type());
            engine.close().await;
        }
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
