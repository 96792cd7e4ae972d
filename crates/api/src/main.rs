use std::sync::Arc;

use anyhow::Context;

use courier_infra::CourierConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = CourierConfig::from_env().context("invalid configuration")?;
    let services = courier_api::app::services::build_services(&config)?;
    let app = courier_api::app::build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
