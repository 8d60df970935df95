use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PUBLISH_WAIT: Duration = Duration::from_secs(5);

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_telemetry(config: &config::Mqtt, telemetry: &Telemetry) -> Result<Message> {
        Ok(Message {
            topic: config.topic().to_string(),
            retain: config.retain(),
            payload: serde_json::to_string(telemetry)?,
        })
    }
} // }}}

#[derive(Debug, Clone)]
pub enum ChannelData {
    Telemetry(Box<Telemetry>),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[derive(Clone)]
pub struct Mqtt {
    config: config::Mqtt,
    channels: Channels,
    shutdown: CancellationToken,
}

impl Mqtt {
    pub fn new(config: config::Mqtt, channels: Channels) -> Self {
        Self {
            config,
            channels,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let (host, port) = c.broker_addr()?;
        let mut options = MqttOptions::new(c.client_id(), host.clone(), port);

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", host, port);

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        if self.channels.to_mqtt.send(ChannelData::Shutdown).is_err() {
            // sender never subscribed, so nothing to flush
            self.shutdown.cancel();
        }
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        Ok(())
    }

    // drives the connection; nothing is subscribed so incoming publishes are ignored
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("mqtt connected"),
                Ok(_) => {} // keepalives etc
                Err(e) => {
                    error!("{}", e);
                    info!("reconnecting in 5s");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // agent -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            let data = match receiver.recv().await {
                Ok(data) => data,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("mqtt publisher lagging, dropped {} samples", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match data {
                ChannelData::Shutdown => {
                    info!("MQTT sender received shutdown signal");
                    let _ = tokio::time::timeout(PUBLISH_WAIT, client.disconnect()).await;
                    break;
                }
                ChannelData::Telemetry(telemetry) => {
                    let message = match Message::for_telemetry(&self.config, &telemetry) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!("failed to serialize telemetry: {}", err);
                            continue;
                        }
                    };
                    self.publish(&client, message).await;
                }
            }
        }

        self.shutdown.cancel();
        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        debug!("publishing: {} = {}", message.topic, message.payload);

        let publish = client.publish(
            &message.topic,
            qos(self.config.qos()),
            message.retain,
            message.payload.into_bytes(),
        );
        match tokio::time::timeout(PUBLISH_WAIT, publish).await {
            Ok(Ok(())) => debug!("published to {}", message.topic),
            Ok(Err(err)) => warn!("mqtt publish error: {}", err),
            Err(_) => warn!("mqtt publish not queued within {:?}, dropping sample", PUBLISH_WAIT),
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.topic())
    }
}
