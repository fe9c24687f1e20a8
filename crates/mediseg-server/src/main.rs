//! MediSeg server entry point
//!
//! Reads the environment configuration (with a few CLI overrides),
//! initializes tracing with daily-rolled file logs, wires the engine
//! together and serves the HTTP API until shutdown.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mediseg_core::{
    InferenceCoordinator, ModelConfig, ModelManager, PipelineConfig, ResultCache,
};
use mediseg_server::api::build_router;
use mediseg_server::{AppState, Settings, TaskRegistry};

#[derive(Debug, Parser)]
#[command(name = "mediseg-server", version, about = "Brain MRI segmentation service")]
struct Cli {
    /// Bind host (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Upload directory (overrides UPLOAD_DIR)
    #[arg(long)]
    upload_dir: Option<std::path::PathBuf>,

    /// Model file (overrides MODEL_PATH)
    #[arg(long)]
    model_path: Option<std::path::PathBuf>,
}

fn apply_cli(mut settings: Settings, cli: Cli) -> Settings {
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(upload_dir) = cli.upload_dir {
        settings.upload_dir = upload_dir;
    }
    if let Some(model_path) = cli.model_path {
        settings.model_path = model_path;
    }
    settings
}

fn init_tracing(settings: &Settings) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(&settings.log_dir, "mediseg.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

#[cfg(feature = "onnx")]
fn predictor_factory(
    settings: &Settings,
    model_config: &ModelConfig,
) -> Box<dyn mediseg_core::PredictorFactory> {
    Box::new(mediseg_core::OnnxPredictorFactory::new(
        settings.model_path.clone(),
        settings.model_input_name.clone(),
        model_config.input_channels,
        model_config.num_classes,
    ))
}

#[cfg(not(feature = "onnx"))]
fn predictor_factory(
    _settings: &Settings,
    _model_config: &ModelConfig,
) -> Box<dyn mediseg_core::PredictorFactory> {
    error!("built without a predictor backend; enable the `onnx` feature");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Arc::new(apply_cli(Settings::from_env(), cli));

    settings
        .ensure_directories()
        .context("creating working directories")?;
    let _log_guard = init_tracing(&settings)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %settings.bind_address(),
        "MediSeg server starting"
    );

    // a deployment may insist on the model being present at startup
    if !settings.model_available() {
        if settings.model_required {
            error!(model = %settings.model_path.display(), "required model file is missing");
            std::process::exit(1);
        }
        tracing::warn!(
            model = %settings.model_path.display(),
            "model file not found; inference will fail until it appears"
        );
    }

    let model_config = ModelConfig {
        model_path: settings.model_path.clone(),
        reload_threshold: settings.reload_threshold,
        max_queue_depth: settings.max_queue_depth,
        ..ModelConfig::default()
    };
    let factory = predictor_factory(&settings, &model_config);
    let model = Arc::new(ModelManager::new(
        model_config,
        settings.model_device,
        factory,
    ));

    let cache = Arc::new(ResultCache::new(settings.results_dir.clone()));
    let pipeline_config = PipelineConfig {
        upload_dir: settings.upload_dir.clone(),
        temp_dir: settings.temp_dir.clone(),
        timeout: settings.inference_timeout,
        ..PipelineConfig::default()
    };
    let coordinator = Arc::new(InferenceCoordinator::new(pipeline_config, model, cache));

    let tasks = Arc::new(TaskRegistry::new(settings.task_ttl));
    tasks.start_sweeper();

    let state = AppState::new(settings.clone(), coordinator.clone(), tasks);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_address())
        .await
        .with_context(|| format!("binding {}", settings.bind_address()))?;
    info!("listening on http://{}", settings.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // release the predictor before the runtime goes away
    coordinator.model().force_cleanup().await;
    info!("MediSeg server shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
