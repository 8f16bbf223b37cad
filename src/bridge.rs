use crate::config::{Config, Source};
use crate::connection::AmpConnection;
use crate::error::{AmpError, Result};
use crate::pubsub::{MessageHandler, PubSub, CONNECTED_PAYLOAD};
use crate::types::{SourceId, ZoneAddress};
use crate::zone::{AttributeDescriptor, AttributeValue, ZoneSnapshot};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};

/// Static description of what the bridge exposes
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Prefix for every topic, empty or ending in `/`
    pub topic_base: String,
    /// Configured zones and their display names
    pub zones: BTreeMap<ZoneAddress, String>,
    /// All six source slots
    pub sources: BTreeMap<SourceId, Source>,
    pub poll_interval: Duration,
    pub max_consecutive_timeouts: u32,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            topic_base: config.mqtt.topic_base()?,
            zones: config.zone_names()?,
            sources: config.source_list()?,
            poll_interval: config.amp.poll_interval(),
            max_consecutive_timeouts: config.amp.max_consecutive_timeouts,
            manufacturer: config.amp.manufacturer.clone(),
            model: config.amp.model.clone(),
            serial: config.amp.serial.clone(),
        })
    }
}

/// One attribute value that differs from the last published state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub zone: ZoneAddress,
    pub attribute: &'static AttributeDescriptor,
    pub value: AttributeValue,
    pub previous: Option<AttributeValue>,
}

/// Outcome of one poll tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Number of attribute updates published
    pub published: usize,
    /// Amps whose enquiry succeeded
    pub polled_amps: usize,
    /// Amps whose enquiry failed, with the reason
    pub failures: Vec<(ZoneAddress, AmpError)>,
}

/// Compare a fresh snapshot against the last published one
///
/// A zone missing from the cache counts as changed in full.
pub fn diff(cache: Option<&ZoneSnapshot>, snapshot: &ZoneSnapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    for (&zone, state) in snapshot {
        let cached = cache.and_then(|c| c.get(&zone));

        for (attribute, value) in state.iter() {
            let previous = cached.map(|c| c.get(attribute));
            if previous != Some(value) {
                changes.push(Change {
                    zone,
                    attribute,
                    value,
                    previous,
                });
            }
        }
    }

    changes
}

/// Polls the amp, publishes state changes and applies set commands
///
/// The poll loop owns the published-state cache. Set commands arrive on
/// concurrent tasks; after applying one they wake the poll loop so the
/// result is observed without waiting out the poll interval. Wakes
/// coalesce, which is fine because every tick reads the full state.
pub struct Bridge {
    amp: Arc<AmpConnection>,
    pubsub: Arc<dyn PubSub>,
    settings: BridgeSettings,
    /// All-zones address of each configured amp to its configured zones
    amps: BTreeMap<ZoneAddress, Vec<ZoneAddress>>,
    /// Set topic to target address and attribute
    setters: HashMap<String, (ZoneAddress, &'static AttributeDescriptor)>,
    cache: Mutex<Option<ZoneSnapshot>>,
    connected: AtomicBool,
    wake: Notify,
}

impl Bridge {
    pub fn new(amp: Arc<AmpConnection>, pubsub: Arc<dyn PubSub>, settings: BridgeSettings) -> Self {
        let mut amps: BTreeMap<ZoneAddress, Vec<ZoneAddress>> = BTreeMap::new();
        for zone in settings.zones.keys() {
            amps.entry(zone.amp_address()).or_default().push(*zone);
        }

        let mut setters = HashMap::new();
        for address in settings.zones.keys().chain(amps.keys()) {
            for attribute in AttributeDescriptor::settable() {
                let topic = format!(
                    "{}set/{}/{}",
                    settings.topic_base,
                    address.topic_fragment(),
                    attribute.name
                );
                setters.insert(topic, (*address, attribute));
            }
        }

        Self {
            amp,
            pubsub,
            settings,
            amps,
            setters,
            cache: Mutex::new(None),
            connected: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    fn status_topic(&self, fragment: impl std::fmt::Display) -> String {
        format!("{}status/{}", self.settings.topic_base, fragment)
    }

    async fn publish_json<T: Serialize + ?Sized>(&self, topic: String, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.pubsub.publish(&topic, payload, true).await
    }

    /// Set topics the bridge accepts, sorted
    pub fn set_topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.setters.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }

    /// Publish the retained configuration metadata
    pub async fn publish_metadata(&self) -> Result<()> {
        let amp_ids: Vec<u8> = self.amps.keys().map(|a| a.amp_id()).collect();
        self.publish_json(self.status_topic("amps"), &amp_ids).await?;

        for (id, source) in &self.settings.sources {
            self.publish_json(self.status_topic(format!("sources/{id}/name")), &source.name)
                .await?;
            self.publish_json(self.status_topic(format!("sources/{id}/enabled")), &source.enabled)
                .await?;
        }

        for (amp, zones) in &self.amps {
            let numbers: Vec<u8> = zones.iter().filter_map(|z| z.zone_number()).collect();
            self.publish_json(self.status_topic(format!("{}/zones", amp.topic_fragment())), &numbers)
                .await?;
        }

        for (zone, name) in &self.settings.zones {
            self.publish_json(self.status_topic(format!("{}/name", zone.topic_fragment())), name)
                .await?;
        }

        self.publish_json(self.status_topic("device/manufacturer"), &self.settings.manufacturer)
            .await?;
        self.publish_json(self.status_topic("device/model"), &self.settings.model)
            .await?;
        self.publish_json(self.status_topic("device/serial"), &self.settings.serial)
            .await?;

        Ok(())
    }

    /// Publish the connected marker, once
    pub async fn mark_connected(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let topic = format!("{}connected", self.settings.topic_base);
        if let Err(e) = self
            .pubsub
            .publish(&topic, CONNECTED_PAYLOAD.to_string(), true)
            .await
        {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!("Bridge connected");
        Ok(())
    }

    /// Forget the connected marker so the next successful tick republishes it
    pub fn reset_connected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Subscribe to every set topic
    pub async fn subscribe_setters(&self) -> Result<()> {
        for topic in self.set_topics() {
            self.pubsub.subscribe(topic).await?;
        }
        Ok(())
    }

    /// Wake the poll loop early
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Poll every configured amp once and publish what changed
    ///
    /// An amp whose enquiry fails contributes nothing to this tick; the
    /// others are published as usual. A failed publish is returned as an
    /// error and ends [`Bridge::run`], since the publisher is assumed to
    /// fail only once its connection is gone for good.
    pub async fn poll_tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut snapshot = ZoneSnapshot::new();

        for &amp in self.amps.keys() {
            match self.amp.zone_enquiry(amp).await {
                Ok(statuses) => {
                    snapshot.extend(statuses);
                    report.polled_amps += 1;
                }
                Err(e) => {
                    tracing::error!("Zone enquiry for amp {} failed: {}", amp.amp_id(), e);
                    report.failures.push((amp, e));
                }
            }
        }

        snapshot.retain(|zone, _| self.settings.zones.contains_key(zone));

        let mut cache = self.cache.lock().await;
        let changes = diff(cache.as_ref(), &snapshot);

        for change in &changes {
            let topic = self.status_topic(format!(
                "{}/{}",
                change.zone.topic_fragment(),
                change.attribute.name
            ));

            tracing::debug!(
                "{}.{} value changed to {} (was {:?}), publishing update to {}",
                change.zone,
                change.attribute.name,
                change.value,
                change.previous,
                topic
            );

            self.publish_json(topic, &change.value).await?;
        }

        report.published = changes.len();
        *cache = Some(snapshot);

        Ok(report)
    }

    /// Wait out the poll interval; returns false when asked to stop
    async fn wait_next_tick(&self, stop_rx: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = stop_rx.recv() => false,
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }

    /// Run the poll loop until stopped or the amp link fails for good
    pub async fn run(&self, mut stop_rx: broadcast::Receiver<()>) -> Result<()> {
        self.publish_metadata().await?;

        tracing::info!("Watching and publishing zone statuses");

        let mut timeouts = 0u32;

        loop {
            let report = self.poll_tick().await?;

            let mut timed_out = false;
            let mut desynced = false;
            for (_, e) in report.failures {
                if e.is_fatal() {
                    return Err(e);
                }
                timed_out |= matches!(e, AmpError::CommandTimeout { .. });
                desynced |= e.is_desync();
            }

            if desynced {
                tracing::warn!("Serial stream out of step, resyncing");
                self.amp.resync().await?;
            }

            timeouts = if timed_out { timeouts + 1 } else { 0 };
            if timeouts >= self.settings.max_consecutive_timeouts {
                tracing::warn!("{} consecutive polls timed out, resyncing", timeouts);
                match self.amp.resync().await {
                    Ok(()) => timeouts = 0,
                    Err(e) => {
                        tracing::error!("Resync after repeated timeouts failed: {}", e);
                        return Err(AmpError::LinkDead { timeouts });
                    }
                }
            }

            if report.polled_amps > 0 {
                if let Err(e) = self.mark_connected().await {
                    tracing::warn!("Failed to publish connected marker: {}", e);
                }
            }

            if !self.wait_next_tick(&mut stop_rx).await {
                tracing::info!("Poll loop stopped");
                return Ok(());
            }
        }
    }

    /// Apply one inbound set message
    pub async fn handle_set(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let (address, attribute) = *self
            .setters
            .get(topic)
            .ok_or_else(|| AmpError::PubSub(format!("no setter for topic {topic}")))?;

        tracing::debug!(
            "Received set command for {}.{} (payload={})",
            address,
            attribute.name,
            String::from_utf8_lossy(payload)
        );

        let json: serde_json::Value = serde_json::from_slice(payload)?;
        let value = attribute.value_from_json(&json)?;

        self.amp.zone_set(address, attribute, value).await?;
        self.wake();

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Bridge {
    async fn on_connected(&self, first: bool) {
        if !first {
            self.reset_connected();
        }

        if let Err(e) = self.subscribe_setters().await {
            tracing::error!("Failed to subscribe to set topics: {}", e);
        }
    }

    async fn on_message(&self, topic: String, payload: Vec<u8>) {
        if !self.setters.contains_key(&topic) {
            tracing::warn!("Received message for unknown topic {}", topic);
            return;
        }

        if let Err(e) = self.handle_set(&topic, &payload).await {
            tracing::error!("Failed to process set message for {}: {}", topic, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdjustBaud, BaudConfig, SerialConfig};
    use crate::protocol::testing::ScriptedTransport;
    use crate::pubsub::testing::RecordingPubSub;
    use crate::types::BaudRate;
    use crate::zone::ZoneState;

    const IDLE: &str = "00010000200707100100";

    fn frame(zone: &str, fields: &str) -> String {
        format!(">{zone}{fields}\r\n#")
    }

    fn amp_reply(amp: u8, fields: &str) -> Vec<u8> {
        let mut reply = format!("?{amp}0\r\n#");
        for zone in 1..=6 {
            reply.push_str(&frame(&format!("{amp}{zone}"), fields));
        }
        reply.into_bytes()
    }

    fn settings(zones: &[&str]) -> BridgeSettings {
        BridgeSettings {
            topic_base: "mwha/".to_string(),
            zones: zones
                .iter()
                .map(|z| (z.parse().unwrap(), format!("Zone {z}")))
                .collect(),
            sources: (1..=6)
                .map(|id| {
                    (
                        id,
                        Source {
                            name: format!("Source {id}"),
                            enabled: id != 6,
                        },
                    )
                })
                .collect(),
            poll_interval: Duration::from_secs(3600),
            max_consecutive_timeouts: 2,
            manufacturer: "Monoprice".to_string(),
            model: "MPR-6ZHMAUT".to_string(),
            serial: String::new(),
        }
    }

    async fn bridge(zones: &[&str]) -> (Bridge, ScriptedTransport, Arc<RecordingPubSub>) {
        let port = ScriptedTransport::new();
        port.reply(b"\r\n#");
        let amp = AmpConnection::open(
            Box::new(port.clone()),
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

        let pubsub = Arc::new(RecordingPubSub::default());
        let bridge = Bridge::new(Arc::new(amp), pubsub.clone(), settings(zones));
        (bridge, port, pubsub)
    }

    fn snapshot(zone: &str, fields: &str) -> ZoneSnapshot {
        let mut snapshot = ZoneSnapshot::new();
        snapshot.insert(zone.parse().unwrap(), ZoneState::decode_fields(fields).unwrap());
        snapshot
    }

    #[test]
    fn diff_reports_only_changes() {
        let cache = snapshot("11", IDLE);

        assert!(diff(Some(&cache), &snapshot("11", IDLE)).is_empty());

        let powered_off = snapshot("11", "00000000200707100100");
        let changes = diff(Some(&cache), &powered_off);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attribute.name, "power");
        assert_eq!(changes[0].value, AttributeValue::Boolean(false));
        assert_eq!(changes[0].previous, Some(AttributeValue::Boolean(true)));
    }

    #[test]
    fn diff_without_cache_reports_everything() {
        let changes = diff(None, &snapshot("11", IDLE));
        assert_eq!(changes.len(), 10);
        assert!(changes.iter().all(|c| c.previous.is_none()));
    }

    #[tokio::test]
    async fn tick_publishes_configured_zones_then_only_changes() {
        let (bridge, port, pubsub) = bridge(&["11"]).await;

        port.reply(&amp_reply(1, IDLE));
        let report = bridge.poll_tick().await.unwrap();
        assert_eq!(report.published, 10);

        let published = pubsub.take();
        assert!(published.iter().all(|p| p.topic.starts_with("mwha/status/amps/1/zones/1/")));
        assert!(published.iter().all(|p| p.retain));
        assert_eq!(pubsub_value(&published, "mwha/status/amps/1/zones/1/volume"), "20");
        assert_eq!(pubsub_value(&published, "mwha/status/amps/1/zones/1/treble"), "0");

        port.reply(&amp_reply(1, IDLE));
        assert_eq!(bridge.poll_tick().await.unwrap().published, 0);
        assert!(pubsub.take().is_empty());

        port.reply(&amp_reply(1, "00000000200707100100"));
        assert_eq!(bridge.poll_tick().await.unwrap().published, 1);
        assert_eq!(
            pubsub.take(),
            vec![crate::pubsub::testing::Published {
                topic: "mwha/status/amps/1/zones/1/power".to_string(),
                payload: "false".to_string(),
                retain: true,
            }]
        );
    }

    fn pubsub_value(published: &[crate::pubsub::testing::Published], topic: &str) -> String {
        published
            .iter()
            .find(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .unwrap()
    }

    #[tokio::test]
    async fn failing_amp_does_not_block_others() {
        let (bridge, port, pubsub) = bridge(&["11", "21"]).await;

        // amp 1 answers, amp 2 stays silent
        port.reply(&amp_reply(1, IDLE));
        let report = bridge.poll_tick().await.unwrap();

        assert_eq!(report.polled_amps, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0.to_string(), "20");
        assert!(matches!(report.failures[0].1, AmpError::CommandTimeout { .. }));

        let published = pubsub.take();
        assert_eq!(published.len(), 10);
        assert!(published.iter().all(|p| p.topic.contains("amps/1/zones/1/")));
    }

    #[tokio::test]
    async fn metadata_topics() {
        let (bridge, _port, pubsub) = bridge(&["11", "13", "22"]).await;
        bridge.publish_metadata().await.unwrap();

        assert_eq!(pubsub.payload("mwha/status/amps").unwrap(), "[1,2]");
        assert_eq!(pubsub.payload("mwha/status/amps/1/zones").unwrap(), "[1,3]");
        assert_eq!(pubsub.payload("mwha/status/amps/2/zones").unwrap(), "[2]");
        assert_eq!(pubsub.payload("mwha/status/amps/1/zones/3/name").unwrap(), "\"Zone 13\"");
        assert_eq!(pubsub.payload("mwha/status/sources/1/name").unwrap(), "\"Source 1\"");
        assert_eq!(pubsub.payload("mwha/status/sources/6/enabled").unwrap(), "false");
        assert_eq!(pubsub.payload("mwha/status/device/model").unwrap(), "\"MPR-6ZHMAUT\"");
        assert!(pubsub.take().iter().all(|p| p.retain));
    }

    #[tokio::test]
    async fn connected_marker_is_published_once() {
        let (bridge, _port, pubsub) = bridge(&["11"]).await;

        bridge.mark_connected().await.unwrap();
        bridge.mark_connected().await.unwrap();
        let published = pubsub.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "mwha/connected");
        assert_eq!(published[0].payload, "2");

        bridge.reset_connected();
        bridge.mark_connected().await.unwrap();
        assert_eq!(pubsub.take().len(), 1);
    }

    #[tokio::test]
    async fn set_topics_cover_zones_and_amps() {
        let (bridge, _port, pubsub) = bridge(&["11", "12"]).await;

        let topics = bridge.set_topics();
        // 3 addresses (11, 12, amp 1) x 8 settable attributes
        assert_eq!(topics.len(), 24);
        assert!(topics.contains(&"mwha/set/amps/1/zones/2/volume"));
        assert!(topics.contains(&"mwha/set/amps/1/mute"));
        assert!(!topics.iter().any(|t| t.ends_with("keypad_connected")));

        bridge.on_connected(true).await;
        let subscriptions = pubsub.subscriptions.lock().unwrap().clone();
        assert_eq!(subscriptions, topics);
    }

    #[tokio::test]
    async fn set_command_reaches_amp_and_wakes_poll_loop() {
        let (bridge, port, _pubsub) = bridge(&["11"]).await;

        port.reply(b"<10VO25\r\n#");
        bridge
            .handle_set("mwha/set/amps/1/volume", b"25")
            .await
            .unwrap();
        assert!(port.written().ends_with("<10VO25\r"));

        let (_stop_tx, mut stop_rx) = broadcast::channel(1);
        let woke = tokio::time::timeout(Duration::from_secs(1), bridge.wait_next_tick(&mut stop_rx))
            .await
            .expect("poll loop should wake before the poll interval");
        assert!(woke);
    }

    #[tokio::test]
    async fn bad_set_messages_are_reported_not_raised() {
        let (bridge, port, _pubsub) = bridge(&["11"]).await;
        let before = port.written();

        bridge
            .on_message("mwha/set/amps/1/zones/1/volume".to_string(), b"\"loud\"".to_vec())
            .await;
        bridge
            .on_message("mwha/set/amps/1/zones/1/treble".to_string(), b"8".to_vec())
            .await;
        bridge
            .on_message("mwha/set/amps/3/zones/1/power".to_string(), b"true".to_vec())
            .await;
        assert_eq!(port.written(), before);

        // the amp rejects the command
        port.reply(b"\r\nCommand Error.\r\n#");
        bridge
            .on_message("mwha/set/amps/1/zones/1/power".to_string(), b"true".to_vec())
            .await;

        let (_stop_tx, mut stop_rx) = broadcast::channel(1);
        let waited = tokio::time::timeout(Duration::from_millis(50), bridge.wait_next_tick(&mut stop_rx)).await;
        assert!(waited.is_err(), "failed sets must not wake the poll loop");
    }

    #[tokio::test]
    async fn run_publishes_and_stops() {
        let (bridge, port, pubsub) = bridge(&["11"]).await;
        port.reply(&amp_reply(1, IDLE));

        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_tx.send(()).unwrap();
        bridge.run(stop_rx).await.unwrap();

        assert_eq!(pubsub.payload("mwha/connected").unwrap(), "2");
        assert_eq!(pubsub.payload("mwha/status/amps/1/zones/1/source").unwrap(), "1");
    }

    #[tokio::test]
    async fn echo_mismatch_resyncs_before_the_next_tick() {
        let (bridge, port, _pubsub) = bridge(&["11"]).await;
        port.reply(b"?11\r\n#").reply(b"\r\n#");

        let (stop_tx, stop_rx) = broadcast::channel(1);
        stop_tx.send(()).unwrap();
        bridge.run(stop_rx).await.unwrap();

        assert!(port.written().ends_with("?10\r\r"));
    }

    #[tokio::test]
    async fn failed_resync_after_echo_mismatch_is_fatal() {
        let (bridge, port, pubsub) = bridge(&["11"]).await;
        port.reply(b"?11\r\n#");

        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let result = bridge.run(stop_rx).await;

        assert!(matches!(result, Err(AmpError::ResyncFailed)));
        // the mismatched enquiry, then four empty resync commands
        assert!(port.written().ends_with("?10\r\r\r\r\r"));
        assert!(pubsub.payload("mwha/connected").is_none());
    }

    struct ClosedPubSub;

    #[async_trait]
    impl PubSub for ClosedPubSub {
        async fn publish(&self, _topic: &str, _payload: String, _retain: bool) -> Result<()> {
            Err(AmpError::PubSub("client closed".to_string()))
        }

        async fn subscribe(&self, _pattern: &str) -> Result<()> {
            Err(AmpError::PubSub("client closed".to_string()))
        }
    }

    #[tokio::test]
    async fn publish_failure_ends_the_tick() {
        let (bridge, port, _pubsub) = bridge(&["11"]).await;
        let bridge = Bridge::new(bridge.amp.clone(), Arc::new(ClosedPubSub), settings(&["11"]));

        port.reply(&amp_reply(1, IDLE));
        assert!(matches!(bridge.poll_tick().await, Err(AmpError::PubSub(_))));

        // nothing was published, so the next tick tries every value again
        assert!(bridge.cache.lock().await.is_none());
    }

    #[tokio::test]
    async fn run_declares_link_dead_after_repeated_timeouts() {
        let (mut bridge, _port, pubsub) = bridge(&["11"]).await;
        bridge.settings.poll_interval = Duration::from_millis(1);

        let (_stop_tx, stop_rx) = broadcast::channel(1);
        let result = bridge.run(stop_rx).await;

        assert!(matches!(result, Err(AmpError::LinkDead { timeouts: 2 })));
        assert!(pubsub.payload("mwha/connected").is_none());
    }
}
