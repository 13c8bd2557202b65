//! Inference runtime check - validates configured models and prints a health
//! snapshot without running any inference.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use inference_runtime::{
    logging, Config, EngineRegistry, HealthMonitor, InferenceEngine, ModelKind, ModelLoader,
    NullBackend, NullEngine,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("inference-runtime-check {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    // Load configuration
    let config = match config_path {
        Some(ref path) => Config::load_from(path),
        None => Config::load(),
    }
    .map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Make sure config.toml exists or set RUNTIME__LANGUAGE__MODEL_PATH.",
            e
        )
    })?;
    logging::init(&config.logging.level);
    tracing::info!("Starting inference-runtime-check {}", VERSION);

    let models = config.models();
    if models.is_empty() {
        tracing::warn!("No models configured");
    }

    let mut failures = 0;
    for (section, model) in models {
        let loader = ModelLoader::new(Arc::new(NullBackend), model.clone());
        match loader.inspect() {
            Ok(metadata) => {
                tracing::info!(section, model = %metadata.path, "Model file is valid");
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }
            Err(e) => {
                tracing::error!(section, "Model check failed: {}", e);
                failures += 1;
            }
        }
    }

    // No native backend is linked into this binary.
    let registry = EngineRegistry::new();
    let engine: Arc<dyn InferenceEngine> = Arc::new(NullEngine::default());
    registry.register(ModelKind::Language, Arc::clone(&engine)).await;
    registry.register(ModelKind::Diffusion, Arc::clone(&engine)).await;

    for (kind, engine) in registry.all().await {
        let monitor = HealthMonitor::new(engine, config.health.clone());
        let snapshot = monitor.health_check();
        tracing::info!(%kind, status = ?snapshot.status, "Health snapshot");
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    registry.close_all().await;

    if failures > 0 {
        return Err(format!("{} configured model(s) failed validation", failures).into());
    }
    Ok(())
}
