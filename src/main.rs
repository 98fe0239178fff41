mod cache;
mod client;
mod collector;
mod config;
mod error;
mod http;
mod metrics;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::cache::DeviceCache;
use crate::client::{Credentials, FlumeClient};
use crate::collector::Collector;
use crate::config::Config;
use crate::metrics::Metrics;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,flume_exporter=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    if let Err(err) = init_tracing() {
        eprintln!("failed to initialize tracing: {err}");
        return ExitCode::FAILURE;
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("{err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("exporter failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let http_client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;
    let client = Arc::new(FlumeClient::new(
        http_client,
        config.api_base.clone(),
        Credentials {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        },
    ));
    let metrics = Arc::new(Metrics::new());

    let cancel = CancellationToken::new();
    let collector = Collector::new(
        client,
        DeviceCache::new(config.device_cache_ttl),
        metrics.clone(),
    );
    let poller = collector.start(config.poll_interval, cancel.clone());

    let app = http::router(http::HttpState { metrics });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "flume-exporter HTTP listening");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = server => {}
    }

    cancel.cancel();
    poller.await.ok();
    Ok(())
}
