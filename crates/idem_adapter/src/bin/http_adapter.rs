#![forbid(unsafe_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use idem_adapter::{reason_codes, router, AdapterConfig, AdapterRuntime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AdapterConfig::from_env()?;
    let addr: SocketAddr = config.bind.parse()?;
    let sweep_enabled = config.sweep_enabled;
    let sweep_interval_ms = config.sweep_interval_ms;

    let runtime = Arc::new(AdapterRuntime::from_config(config)?);
    if sweep_enabled {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(sweep_interval_ms));
            loop {
                ticker.tick().await;
                let runtime = runtime_for_worker.clone();
                match tokio::task::spawn_blocking(move || runtime.run_sweep_pass()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::warn!(
                        reason_code = reason_codes::ADAPTER_SWEEP_PASS_FAILED.0,
                        error = %err,
                        "expiry sweep pass failed"
                    ),
                    Err(err) => tracing::error!(
                        reason_code = reason_codes::ADAPTER_SWEEP_PASS_FAILED.0,
                        error = %err,
                        "expiry sweep task failed"
                    ),
                }
            }
        });
    }

    tracing::info!(
        %addr,
        ledger_backend = %runtime.health_report().ledger_backend,
        sweep_enabled,
        sweep_interval_ms,
        "idem_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}
