use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic: String,
    pub mqtt_keepalive_secs: u64,
    pub max_queue: usize,
    pub connect_attempts: u32,
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("SINK_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("SINK_DATABASE_URL or DATABASE_URL is required")?;

        let mqtt_host = env::var("SINK_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("SINK_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("SINK_MQTT_USERNAME").ok();
        let mqtt_password = env::var("SINK_MQTT_PASSWORD").ok();
        let mqtt_client_id = env::var("SINK_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("timescale-sink-{}", std::process::id()));
        let mqtt_topic = env::var("SINK_MQTT_TOPIC").unwrap_or_else(|_| "/office".to_string());
        let mqtt_keepalive_secs = env::var("SINK_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let max_queue = env::var("SINK_MAX_QUEUE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(1024);
        let connect_attempts = env::var("SINK_CONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(1);
        let stats_interval_secs = env::var("SINK_STATS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(60);

        Ok(Self {
            database_url,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic,
            mqtt_keepalive_secs,
            max_queue,
            connect_attempts,
            stats_interval_secs,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
