//! MQTT implementation of the device transport.
//!
//! One broker connection carries both directions: commands are published with
//! QoS 1 (at-least-once intent, no ack awaited), and the event loop forwards
//! everything under `feeders/#` and `cameras/#` to the event sink.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::{Error, Result};

use super::{CommandTransport, DeviceCommand, EventSink};

const EVENT_TOPIC_FILTERS: [&str; 2] = ["feeders/#", "cameras/#"];

/// Delay before re-polling after a connection error; rumqttc reconnects on
/// the next poll, so this only paces the retry storm.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// MQTT-backed [`CommandTransport`].
#[derive(Clone)]
pub struct MqttCommandTransport {
    client: AsyncClient,
}

impl MqttCommandTransport {
    /// Build the client handle and its event loop from configuration.
    ///
    /// The event loop must be driven by [`run_event_loop`] for anything
    /// (including publishes) to make progress.
    #[must_use]
    pub fn new(config: &MqttConfig) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, config.channel_capacity);
        (Self { client }, event_loop)
    }

    /// Handle for driving the event loop.
    #[must_use]
    pub fn client(&self) -> AsyncClient {
        self.client.clone()
    }
}

#[async_trait]
impl CommandTransport for MqttCommandTransport {
    async fn publish(&self, thing_name: &str, command: DeviceCommand) -> Result<()> {
        let topic = command.topic(thing_name);
        let payload = serde_json::to_vec(&command)?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Transport(format!("publish to {topic} failed: {e}")))?;

        debug!(topic = %topic, "device command published");
        Ok(())
    }
}

/// Drive the broker connection until `shutdown` fires.
///
/// Subscribes to the device event topics on every (re)connect and forwards
/// inbound publishes to the sink. Connection errors pace down and let rumqttc
/// reconnect on the next poll.
pub async fn run_event_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    sink: Arc<dyn EventSink>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("MQTT event loop shutting down");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    for filter in EVENT_TOPIC_FILTERS {
                        if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                            warn!(filter, error = %e, "MQTT subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    sink.handle_message(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for MqttCommandTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttCommandTransport").finish()
    }
}
