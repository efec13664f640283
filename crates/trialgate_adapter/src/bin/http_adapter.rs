#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trialgate_adapter::{in_memory_runtime, router, AdapterConfig, AdapterState, TRIAL_ROUTE};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AdapterConfig::from_env()?;
    let state = if config.kv_enabled {
        let (runtime, store) = in_memory_runtime(&config)?;
        let purge_interval_ms = config.purge_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(purge_interval_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = store.purge_expired() {
                    warn!(error = %err, "trialgate kv purge pass failed");
                }
            }
        });
        AdapterState::configured(runtime)
    } else {
        warn!("TRIALGATE_KV_ENABLED is off; trial route will answer 503 KV_NOT_CONFIGURED");
        AdapterState::unconfigured()
    };

    let app = router(state);
    info!(
        addr = %config.bind,
        route = TRIAL_ROUTE,
        kv_enabled = config.kv_enabled,
        rate_limit_ms = config.gate.rate_limit.interval_ms,
        "trialgate_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("trialgate_http shutting down");
}
