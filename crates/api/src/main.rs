use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use relay_api::app::build_app;
use relay_api::config::AppConfig;
use relay_core::ExitProcess;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let app = build_app(config, Arc::new(ExitProcess))
        .await
        .context("startup failed")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    app.workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
