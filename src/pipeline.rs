use crate::codec::{self, SensorReading};
use crate::gateway::GatewayError;
use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Envelope handed from the MQTT event loop to the worker. Consumed exactly
/// once; never retried or persisted in raw form.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Storage seam the worker drives. `ensure_connected` must be idempotent
/// while the connection is open; `insert` appends one row tagged with the
/// sensor identity and a server-assigned timestamp.
pub trait ReadingStore: Send {
    fn ensure_connected(&mut self) -> impl Future<Output = Result<(), GatewayError>> + Send;
    fn insert(
        &mut self,
        sensor_id: &str,
        reading: &SensorReading,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Sending half of the delivery queue plus the shared counters.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<RawMessage>,
    stats: Arc<SinkStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<RawMessage>, stats: Arc<SinkStats>) -> Self {
        Self { tx, stats }
    }

    /// Queues one message for the worker, preserving arrival order. The
    /// queue is bounded; when full this holds the caller back instead of
    /// dropping readings.
    pub async fn enqueue(&self, msg: RawMessage) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(queue_depth, sensor = %msg.topic, "queued reading");
        if let Err(err) = self.tx.send(msg).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Per-outcome counters so failure rates stay queryable even though every
/// per-message error is otherwise swallowed.
#[derive(Debug)]
pub struct SinkStats {
    pub queue_depth: AtomicU64,
    pub received: AtomicU64,
    pub inserted: AtomicU64,
    pub decode_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub insert_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl SinkStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            received: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            insert_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn log_summary(&self) {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        tracing::info!(
            queue_depth = self.queue_depth.load(Ordering::Relaxed),
            received = self.received.load(Ordering::Relaxed),
            inserted = self.inserted.load(Ordering::Relaxed),
            decode_failures = self.decode_failures.load(Ordering::Relaxed),
            connect_failures = self.connect_failures.load(Ordering::Relaxed),
            insert_failures = self.insert_failures.load(Ordering::Relaxed),
            last_error = last_error.as_deref().unwrap_or(""),
            "sink counters"
        );
    }
}

/// Spawns the single long-lived ingestion worker. Each message runs
/// decode -> ensure-connected -> insert to completion before the next is
/// dequeued, so inserts are never concurrent and follow enqueue order.
/// Any per-message failure drops that message and moves on; the loop ends
/// only when every sender is gone and the queue is drained.
pub fn spawn_worker<S>(
    mut store: S,
    mut rx: mpsc::Receiver<RawMessage>,
    stats: Arc<SinkStats>,
) -> JoinHandle<()>
where
    S: ReadingStore + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);

            let reading = match codec::decode(&msg.payload) {
                Ok(reading) => reading,
                Err(err) => {
                    stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                    stats.record_error(err.to_string());
                    tracing::warn!(error=%err, sensor=%msg.topic, "dropping undecodable payload");
                    continue;
                }
            };

            if let Err(err) = store.ensure_connected().await {
                stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                stats.record_error(err.to_string());
                tracing::warn!(error=%err, sensor=%msg.topic, "storage unavailable; dropping reading");
                continue;
            }

            match store.insert(&msg.topic, &reading).await {
                Ok(()) => {
                    stats.inserted.fetch_add(1, Ordering::Relaxed);
                    stats.clear_error();
                    tracing::info!(
                        sensor = %msg.topic,
                        wifi = reading.wifi,
                        co2 = reading.co2,
                        pm01 = reading.pm01,
                        pm25 = reading.pm25,
                        pm10 = reading.pm10,
                        pm03pcount = reading.pm03_count,
                        tvoc = reading.tvoc,
                        nox = reading.nox,
                        temperature = reading.temperature,
                        humidity = reading.humidity,
                        boot = reading.boot,
                        lag_ms = (Utc::now() - msg.received_at).num_milliseconds(),
                        "stored reading"
                    );
                }
                Err(err) => {
                    stats.insert_failures.fetch_add(1, Ordering::Relaxed);
                    stats.record_error(err.to_string());
                    tracing::warn!(error=%err, sensor=%msg.topic, "insert failed; dropping reading");
                }
            }
        }
        tracing::info!("delivery queue closed; worker drained");
    })
}
