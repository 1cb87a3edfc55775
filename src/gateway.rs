use crate::codec::SensorReading;
use crate::config::Config;
use crate::pipeline::ReadingStore;
use anyhow::{Context, Result};
use sqlx::{Connection, PgConnection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("storage connect failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("insert rejected: {0}")]
    Insert(#[source] sqlx::Error),
    #[error("gateway connection is closed")]
    NotConnected,
}

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sensor_measurements (
    time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    sensor_id TEXT NOT NULL,
    wifi INT,
    co2 INT,
    pm01 INT,
    pm25 INT,
    pm10 INT,
    pm03pcount INT,
    tvoc INT,
    nox INT,
    temperature FLOAT,
    humidity INT,
    boot INT
)
"#;

const CREATE_HYPERTABLE_SQL: &str =
    "SELECT create_hypertable('sensor_measurements', 'time', if_not_exists => TRUE)";

const INSERT_SQL: &str = r#"
INSERT INTO sensor_measurements (
    sensor_id, wifi, co2, pm01, pm25, pm10, pm03pcount, tvoc, nox, temperature, humidity, boot
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

/// The single mutable handle to the storage backend. Owned exclusively by
/// the ingestion worker after startup; `conn` is `None` while the handle is
/// logically closed.
pub struct PgGateway {
    database_url: String,
    connect_attempts: u32,
    conn: Option<PgConnection>,
}

impl PgGateway {
    /// Startup connect; failure here is fatal for the process.
    pub async fn connect(config: &Config) -> Result<Self> {
        let conn = PgConnection::connect(&config.database_url)
            .await
            .context("unable to connect to storage backend")?;
        Ok(Self {
            database_url: config.database_url.clone(),
            connect_attempts: config.connect_attempts.max(1),
            conn: Some(conn),
        })
    }

    /// Provisions the measurements hypertable once at startup. The table
    /// must exist; the hypertable conversion is allowed to fail so the sink
    /// still runs against a plain Postgres instance.
    pub async fn ensure_schema(&mut self) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(GatewayError::NotConnected)
            .context("cannot provision schema")?;
        sqlx::query(CREATE_TABLE_SQL)
            .execute(&mut *conn)
            .await
            .context("failed to create sensor_measurements table")?;
        if let Err(err) = sqlx::query(CREATE_HYPERTABLE_SQL).execute(&mut *conn).await {
            tracing::warn!(error=%err, "hypertable conversion failed; continuing with plain table");
        } else {
            tracing::info!("sensor_measurements hypertable ready");
        }
        Ok(())
    }
}

impl ReadingStore for PgGateway {
    /// No-op while the held connection still answers a ping. Once closed,
    /// makes up to `connect_attempts` fresh establishments and leaves the
    /// handle closed on failure; the next message triggers another round.
    async fn ensure_connected(&mut self) -> Result<(), GatewayError> {
        if let Some(conn) = self.conn.as_mut() {
            match conn.ping().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error=%err, "storage connection went away");
                    self.conn = None;
                }
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match PgConnection::connect(&self.database_url).await {
                Ok(conn) => {
                    self.conn = Some(conn);
                    tracing::info!(attempt, "storage connection established");
                    return Ok(());
                }
                Err(err) if attempt >= self.connect_attempts => {
                    return Err(GatewayError::Connect(err));
                }
                Err(err) => {
                    tracing::debug!(error=%err, attempt, "reconnect attempt failed");
                }
            }
        }
    }

    /// One parameterized row append; `time` is assigned server-side. A
    /// rejected insert keeps the handle open, a dead socket is caught by the
    /// next cycle's ping.
    async fn insert(
        &mut self,
        sensor_id: &str,
        reading: &SensorReading,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.as_mut().ok_or(GatewayError::NotConnected)?;
        sqlx::query(INSERT_SQL)
            .bind(sensor_id)
            .bind(reading.wifi)
            .bind(reading.co2)
            .bind(reading.pm01)
            .bind(reading.pm25)
            .bind(reading.pm10)
            .bind(reading.pm03_count)
            .bind(reading.tvoc)
            .bind(reading.nox)
            .bind(reading.temperature as f64)
            .bind(reading.humidity)
            .bind(reading.boot)
            .execute(&mut *conn)
            .await
            .map_err(GatewayError::Insert)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{spawn_worker, PipelineHandle, RawMessage, SinkStats};
    use bytes::Bytes;
    use chrono::Utc;
    use sqlx::Row;
    use std::env;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn integration_url() -> Option<String> {
        if env::var("SINK_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return None;
        }
        env::var("SINK_TEST_DATABASE_URL").ok()
    }

    fn test_config(database_url: String) -> Config {
        Config {
            database_url,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "timescale-sink-test".to_string(),
            mqtt_topic: "/office".to_string(),
            mqtt_keepalive_secs: 30,
            max_queue: 8,
            connect_attempts: 1,
            stats_interval_secs: 60,
        }
    }

    async fn scratch_schema(database_url: &str, schema: &str) -> Result<String> {
        let mut admin = PgConnection::connect(database_url).await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut admin)
            .await?;
        admin.close().await?;
        Ok(format!(
            "{database_url}?options=-c%20search_path%3D{schema}"
        ))
    }

    async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
        let mut admin = PgConnection::connect(database_url).await?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&mut admin)
            .await?;
        admin.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() -> Result<()> {
        let Some(database_url) = integration_url() else {
            return Ok(());
        };
        let schema = format!("sink_test_schema_{}", std::process::id());
        let url = scratch_schema(&database_url, &schema).await?;

        let mut gateway = PgGateway::connect(&test_config(url.clone())).await?;
        gateway.ensure_schema().await?;
        gateway.ensure_schema().await?;

        let mut gateway = PgGateway::connect(&test_config(url)).await?;
        gateway.ensure_schema().await?;

        drop_schema(&database_url, &schema).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reading_persists_end_to_end() -> Result<()> {
        let Some(database_url) = integration_url() else {
            return Ok(());
        };
        let schema = format!("sink_test_e2e_{}", std::process::id());
        let url = scratch_schema(&database_url, &schema).await?;

        let mut gateway = PgGateway::connect(&test_config(url.clone())).await?;
        gateway.ensure_schema().await?;

        let stats = Arc::new(SinkStats::new());
        let (tx, rx) = mpsc::channel(8);
        let pipeline = PipelineHandle::new(tx, stats.clone());
        let worker = spawn_worker(gateway, rx, stats.clone());

        let reading = SensorReading {
            wifi: -50,
            co2: 450,
            pm01: 3,
            pm25: 5,
            pm10: 8,
            pm03_count: 1200,
            tvoc: 100,
            nox: 1,
            temperature: 21.5,
            humidity: 40,
            boot: 2,
        };
        pipeline
            .enqueue(RawMessage {
                topic: "/office".to_string(),
                payload: Bytes::copy_from_slice(&reading.encode()),
                received_at: Utc::now(),
            })
            .await?;
        drop(pipeline);
        worker.await?;

        let mut conn = PgConnection::connect(&url).await?;
        let rows = sqlx::query(
            "SELECT sensor_id, wifi, co2, pm01, pm25, pm10, pm03pcount, tvoc, nox, \
             temperature, humidity, boot FROM sensor_measurements",
        )
        .fetch_all(&mut conn)
        .await?;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.try_get::<String, _>("sensor_id")?, "/office");
        assert_eq!(row.try_get::<i32, _>("wifi")?, -50);
        assert_eq!(row.try_get::<i32, _>("co2")?, 450);
        assert_eq!(row.try_get::<i32, _>("pm01")?, 3);
        assert_eq!(row.try_get::<i32, _>("pm25")?, 5);
        assert_eq!(row.try_get::<i32, _>("pm10")?, 8);
        assert_eq!(row.try_get::<i32, _>("pm03pcount")?, 1200);
        assert_eq!(row.try_get::<i32, _>("tvoc")?, 100);
        assert_eq!(row.try_get::<i32, _>("nox")?, 1);
        assert!((row.try_get::<f64, _>("temperature")? - 21.5).abs() < f64::EPSILON);
        assert_eq!(row.try_get::<i32, _>("humidity")?, 40);
        assert_eq!(row.try_get::<i32, _>("boot")?, 2);
        conn.close().await?;

        assert_eq!(
            stats.inserted.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        drop_schema(&database_url, &schema).await?;
        Ok(())
    }
}
