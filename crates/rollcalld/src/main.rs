use anyhow::{Context, Result};
use rollcall_core::OnnxAnalyzer;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod routes;
mod service;
mod store;
mod upload;

#[cfg(test)]
mod testing;

use engine::BoxedAnalyzer;
use service::{AttendanceService, MatchSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        match_threshold = config.match_threshold,
        duplicate_threshold = config.duplicate_threshold,
        "configuration loaded"
    );

    std::fs::create_dir_all(&config.upload_dir).with_context(|| {
        format!(
            "failed to create upload directory {}",
            config.upload_dir.display()
        )
    })?;

    let store = store::Store::open(&config.db_path, config.embedding_dim)
        .await
        .context("failed to open database")?;

    let model_dir = config.model_dir.clone();
    let engine = engine::spawn_engine(move || {
        let analyzer = OnnxAnalyzer::load_from_dir(&model_dir)?;
        Ok(Box::new(analyzer) as BoxedAnalyzer)
    })
    .context("failed to spawn face engine")?;

    if config.preload_models {
        engine
            .preload()
            .await
            .context("failed to load face models")?;
        tracing::info!("face models loaded");
    }

    let settings = MatchSettings {
        match_threshold: config.match_threshold,
        duplicate_threshold: config.duplicate_threshold,
        embedding_dim: config.embedding_dim,
    };
    let service = AttendanceService::new(engine, store, settings, config.upload_dir.clone());
    let app = routes::app(service, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
