use crate::config::Config;
use crate::pipeline::{PipelineHandle, RawMessage};
use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

/// Subscribes to the sensor topic and bridges publishes onto the delivery
/// queue. This path never decodes payloads or touches storage.
///
/// A connection failure before the first ConnAck is a fatal startup error;
/// once connected, the loop rebuilds the client and resubscribes forever.
pub async fn run_listener(config: Config, pipeline: PipelineHandle) -> Result<()> {
    let mut connected_once = false;
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
        client
            .subscribe(config.mqtt_topic.clone(), QoS::AtMostOnce)
            .await
            .context("failed to queue MQTT subscribe")?;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected_once = true;
                    tracing::info!(topic=%config.mqtt_topic, "subscribed to sensor feed");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let msg = RawMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        received_at: Utc::now(),
                    };
                    pipeline
                        .enqueue(msg)
                        .await
                        .context("delivery queue closed")?;
                }
                Ok(_) => {}
                Err(err) if !connected_once => {
                    return Err(err).context("unable to reach MQTT broker");
                }
                Err(err) => {
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
