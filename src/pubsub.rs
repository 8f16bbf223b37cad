use crate::config::MqttConfig;
use crate::error::{AmpError, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Retained payload of `{base}connected` while the bridge is up
pub const CONNECTED_PAYLOAD: &str = "2";
/// Last will payload of `{base}connected`
pub const DISCONNECTED_PAYLOAD: &str = "0";

/// Outbound side of a publish/subscribe client
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()>;

    async fn subscribe(&self, pattern: &str) -> Result<()>;
}

/// Receives broker session and message events
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Broker session established; `first` is false on reconnects
    async fn on_connected(&self, first: bool);

    /// Inbound publish on a subscribed topic
    async fn on_message(&self, topic: String, payload: Vec<u8>);
}

/// [`PubSub`] over an MQTT broker connection
#[derive(Clone)]
pub struct MqttPubSub {
    client: AsyncClient,
}

impl MqttPubSub {
    /// Build the client; nothing is sent until the event loop is polled
    ///
    /// A retained last will marks `{topic_base}connected` as `0` when the
    /// session drops.
    pub fn new(config: &MqttConfig, topic_base: &str) -> Result<(Self, EventLoop)> {
        let url = config.parsed_url()?;
        let tls = url.scheme() == "mqtts";
        let host = url.host_str().unwrap_or("localhost");
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT });

        tracing::info!("Connecting to MQTT broker {}:{}", host, port);

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        options.set_last_will(LastWill::new(
            format!("{topic_base}connected"),
            DISCONNECTED_PAYLOAD,
            QoS::AtLeastOnce,
            true,
        ));

        if !url.username().is_empty() {
            options.set_credentials(url.username(), url.password().unwrap_or_default());
        }

        if tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok((Self { client }, eventloop))
    }

    /// Drive the MQTT event loop until stopped
    ///
    /// Session setup and each inbound publish run on their own tasks, so the
    /// loop keeps polling while they wait on the client request queue. Connection errors back off exponentially
    /// (1s, 2s, 4s, ... 60s) while the client reconnects.
    pub async fn run(
        mut eventloop: EventLoop,
        handler: Arc<dyn MessageHandler>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        let mut backoff = Duration::from_secs(0);
        let mut first = true;

        loop {
            let event = tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::info!("MQTT event loop stopped");
                    break;
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Connected to MQTT broker");
                    backoff = Duration::from_secs(0);
                    // subscribing queues requests that only this loop can drain
                    let handler = handler.clone();
                    tokio::spawn(async move { handler.on_connected(first).await });
                    first = false;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler
                            .on_message(publish.topic, publish.payload.to_vec())
                            .await;
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    backoff = if backoff == Duration::from_secs(0) {
                        Duration::from_secs(1)
                    } else {
                        (backoff * 2).min(MAX_BACKOFF)
                    };
                    tracing::error!("MQTT error: {}, retrying in {:?}", e, backoff);

                    tokio::select! {
                        _ = stop_rx.recv() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Disconnect cleanly from the broker
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for MqttPubSub {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(AmpError::from)
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        tracing::debug!("Subscribing to {}", pattern);
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(AmpError::from)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeSettings};
    use crate::config::{AdjustBaud, BaudConfig, SerialConfig, Source};
    use crate::connection::AmpConnection;
    use crate::protocol::testing::ScriptedTransport;
    use crate::types::{BaudRate, ZoneAddress};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct BrokerCounts {
        subscribes: AtomicUsize,
        publishes: AtomicUsize,
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accepts one session and acknowledges everything it is sent
    async fn serve(listener: TcpListener, counts: Arc<BrokerCounts>) -> std::io::Result<()> {
        let (mut stream, _) = listener.accept().await?;

        read_packet(&mut stream).await?;
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;

        loop {
            let (header, body) = read_packet(&mut stream).await?;
            match header >> 4 {
                // PUBLISH, acked when QoS 1
                3 => {
                    counts.publishes.fetch_add(1, Ordering::SeqCst);
                    if (header >> 1) & 0x03 == 1 {
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let id = &body[2 + topic_len..4 + topic_len];
                        stream.write_all(&[0x40, 0x02, id[0], id[1]]).await?;
                    }
                }
                // SUBSCRIBE
                8 => {
                    counts.subscribes.fetch_add(1, Ordering::SeqCst);
                    stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await?;
                }
                // PINGREQ
                12 => stream.write_all(&[0xd0, 0x00]).await?,
                // DISCONNECT
                14 => return Ok(()),
                _ => {}
            }
        }
    }

    async fn wait_until(what: &str, done: impl Fn() -> bool) {
        let wait = async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn full_install() -> BridgeSettings {
        BridgeSettings {
            topic_base: "mwha/".to_string(),
            zones: (1..=3)
                .flat_map(|amp| {
                    (1..=6).map(move |zone| (ZoneAddress::zone(amp, zone).unwrap(), format!("Zone {amp}{zone}")))
                })
                .collect(),
            sources: (1..=6)
                .map(|id| {
                    (
                        id,
                        Source {
                            name: format!("Source {id}"),
                            enabled: true,
                        },
                    )
                })
                .collect(),
            poll_interval: Duration::from_secs(3600),
            max_consecutive_timeouts: 5,
            manufacturer: "Monoprice".to_string(),
            model: "MPR-6ZHMAUT".to_string(),
            serial: String::new(),
        }
    }

    #[tokio::test]
    async fn session_setup_does_not_stall_the_event_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let counts = Arc::new(BrokerCounts::default());
        tokio::spawn(serve(listener, counts.clone()));

        let config = MqttConfig {
            url: format!("mqtt://127.0.0.1:{port}/mwha/"),
            client_id: "mwha-test".to_string(),
            keep_alive: 30,
        };
        let (mqtt, eventloop) = MqttPubSub::new(&config, "mwha/").unwrap();

        let serial = ScriptedTransport::new();
        serial.reply(b"\r\n#");
        let amp = AmpConnection::open(
            Box::new(serial),
            &SerialConfig {
                port: "/dev/null".to_string(),
                read_timeout: 1.0,
                baud: BaudConfig::Rate(BaudRate::B9600),
                adjust_baud: AdjustBaud::Off,
                reset_baud: false,
            },
        )
        .await
        .unwrap();

        let bridge = Arc::new(Bridge::new(Arc::new(amp), Arc::new(mqtt.clone()), full_install()));
        let set_topics = bridge.set_topics().len();
        // 18 zones plus 3 amps, 8 settable attributes each
        assert_eq!(set_topics, 168);

        // metadata publishes compete with the subscriptions for the request queue
        let metadata = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.publish_metadata().await })
        };

        let (stop_tx, _) = broadcast::channel(1);
        let handler: Arc<dyn MessageHandler> = bridge.clone();
        let events = tokio::spawn(MqttPubSub::run(eventloop, handler, stop_tx.subscribe()));

        wait_until("set subscriptions", || {
            counts.subscribes.load(Ordering::SeqCst) == set_topics
        })
        .await;

        tokio::time::timeout(Duration::from_secs(5), metadata)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // amps, 6 sources x 2, 3 zone lists, 18 names, 3 device fields
        let metadata_publishes = 1 + 12 + 3 + 18 + 3;

        tokio::time::timeout(
            Duration::from_secs(2),
            mqtt.publish("mwha/connected", CONNECTED_PAYLOAD.to_string(), true),
        )
        .await
        .unwrap()
        .unwrap();
        wait_until("publish after setup", || {
            counts.publishes.load(Ordering::SeqCst) == metadata_publishes + 1
        })
        .await;

        stop_tx.send(()).unwrap();
        events.await.unwrap();
    }
}
