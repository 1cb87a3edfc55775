mod codec;
mod config;
mod gateway;
mod mqtt;
mod pipeline;

use crate::config::Config;
use crate::gateway::PgGateway;
use crate::pipeline::{spawn_worker, PipelineHandle, SinkStats};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,timescale_sink=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let mut gateway = PgGateway::connect(&config).await?;
    gateway.ensure_schema().await?;

    let stats = Arc::new(SinkStats::new());
    let (tx, rx) = mpsc::channel(config.max_queue);
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(gateway, rx, stats.clone());

    let listener_config = config.clone();
    let listener_pipeline = pipeline.clone();
    let mut listener_handle =
        tokio::spawn(async move { mqtt::run_listener(listener_config, listener_pipeline).await });

    let stats_handle = {
        let stats = stats.clone();
        let interval = config.stats_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_summary();
            }
        })
    };

    tokio::select! {
        res = &mut listener_handle => {
            match res {
                Ok(Err(err)) => return Err(err),
                Ok(Ok(())) => {}
                Err(err) => tracing::error!(error=%err, "MQTT listener task failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    stats_handle.abort();
    listener_handle.abort();
    drop(pipeline);
    let _ = worker_handle.await;

    Ok(())
}
