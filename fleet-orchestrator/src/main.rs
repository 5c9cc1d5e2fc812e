use anyhow::Context;
use dotenv::dotenv;
use fleet_orchestrator::api::create_router;
use fleet_orchestrator::provider_manager::ProviderManager;
use fleet_orchestrator::{reconciliation, Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    let provider = ProviderManager::get_provider(&config)?;
    tracing::info!("☁️ Using provider '{}'", provider.name());

    let listen_addr = config.listen_addr;
    let reconcile_interval = config.reconcile_interval;
    let orchestrator = Arc::new(Orchestrator::from_config(provider, config).await?);

    // job-reconciler (vanished instances)
    if let Some(period) = reconcile_interval {
        let orch = orchestrator.clone();
        tokio::spawn(async move {
            reconciliation::run(orch, period).await;
        });
    }

    let app = create_router(orchestrator);
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    tracing::info!("Fleet orchestrator listening on {}", listen_addr);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
