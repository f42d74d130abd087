use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use jarvis_api_server::config::Settings;
use jarvis_api_server::logging;
use jarvis_api_server::services::LlmService;
use jarvis_api_server::utils::{SystemClock, TokioSleeper};
use jarvis_api_server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;

    logging::init_logger()?;
    info!("🚀 Starting JARVIS API Server...");
    info!(
        model = %settings.llm.model,
        rate_limiting = settings.rate_limit.enabled,
        "✅ Configuration loaded"
    );

    let llm_service = Arc::new(LlmService::new(settings.llm.clone())?);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    let state = AppState::new(
        settings,
        llm_service,
        Arc::new(SystemClock),
        Arc::new(TokioSleeper),
    );
    let background_tasks = state.start_background_tasks();
    info!(count = background_tasks.len(), "✅ Background tasks started");

    let app = build_router(state);

    info!("🎯 Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for task in background_tasks {
        task.stop().await;
    }
    info!("👋 Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
