use crate::error::{AmpError, Result};
use crate::types::{BaudRate, SourceId, ZoneAddress, VALID_SOURCES};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_MQTT_URL: &str = "mqtt://localhost/mwha/";
const DEFAULT_TOPIC_BASE: &str = "mwha/";

/// Daemon configuration, loaded from TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub amp: AmpConfig,
    /// Zone address (`"11"`) to display name
    pub zones: BTreeMap<String, String>,
    /// Source number (`"1"`) to display name
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

/// Requested link baud
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudConfig {
    Auto,
    Rate(BaudRate),
}

/// Baud to switch to after the link is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustBaud {
    Off,
    Max,
    Rate(BaudRate),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Device path, or `tcp://host:port` for an IP serial server
    pub port: String,
    /// Per byte read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: f64,
    #[serde(default = "default_baud")]
    pub baud: BaudConfig,
    #[serde(default = "default_adjust_baud")]
    pub adjust_baud: AdjustBaud,
    #[serde(default = "default_true")]
    pub reset_baud: bool,
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    /// `mqtt://` or `mqtts://`; the path is the topic base
    #[serde(default = "default_mqtt_url")]
    pub url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: default_mqtt_url(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl MqttConfig {
    pub fn parsed_url(&self) -> Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| AmpError::Config(format!("mqtt.url: {e}")))?;

        match url.scheme() {
            "mqtt" | "mqtts" => {}
            scheme => {
                return Err(AmpError::Config(format!(
                    "mqtt.url: unsupported scheme {scheme:?}, expected mqtt or mqtts"
                )))
            }
        }

        if url.host_str().is_none() {
            return Err(AmpError::Config("mqtt.url: missing host".to_string()));
        }

        Ok(url)
    }

    /// Topic prefix taken from the URL path, always ending in `/` unless empty
    ///
    /// `mqtt://host` uses the default base, `mqtt://host/` uses no prefix.
    pub fn topic_base(&self) -> Result<String> {
        let url = self.parsed_url()?;
        let path = url.path();

        if path.is_empty() {
            return Ok(DEFAULT_TOPIC_BASE.to_string());
        }

        let base = &path[1..];
        if base.is_empty() || base.ends_with('/') {
            Ok(base.to_string())
        } else {
            Ok(format!("{base}/"))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmpConfig {
    /// Seconds between zone status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Consecutive timed out polls tolerated before the link is declared dead
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub disabled_sources: Vec<SourceId>,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            manufacturer: default_manufacturer(),
            model: default_model(),
            serial: String::new(),
            disabled_sources: Vec::new(),
        }
    }
}

impl AmpConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

/// A source input as published in the metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub enabled: bool,
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AmpError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse and validate TOML text
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| AmpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.serial.read_timeout.is_nan() || self.serial.read_timeout <= 0.0 {
            return Err(AmpError::Config("serial.read_timeout must be positive".to_string()));
        }
        if self.amp.poll_interval.is_nan() || self.amp.poll_interval <= 0.0 {
            return Err(AmpError::Config("amp.poll_interval must be positive".to_string()));
        }
        if self.amp.max_consecutive_timeouts == 0 {
            return Err(AmpError::Config(
                "amp.max_consecutive_timeouts must be at least 1".to_string(),
            ));
        }

        self.mqtt.parsed_url()?;
        self.zone_names()?;
        self.source_list()?;

        Ok(())
    }

    /// Configured zones keyed by address
    pub fn zone_names(&self) -> Result<BTreeMap<ZoneAddress, String>> {
        if self.zones.is_empty() {
            return Err(AmpError::Config("at least one zone must be configured".to_string()));
        }

        self.zones
            .iter()
            .map(|(id, name)| {
                let address = ZoneAddress::parse_zone(id)
                    .map_err(|e| AmpError::Config(format!("zones.{id}: {e}")))?;
                if name.is_empty() {
                    return Err(AmpError::Config(format!("zones.{id}: name cannot be empty")));
                }
                Ok((address, name.clone()))
            })
            .collect()
    }

    /// All six source slots; unnamed sources get `Source n`
    pub fn source_list(&self) -> Result<BTreeMap<SourceId, Source>> {
        let mut named = BTreeMap::new();
        for (id, name) in &self.sources {
            let source = parse_source_id(id)?;
            if name.is_empty() {
                return Err(AmpError::Config(format!("sources.{id}: name cannot be empty")));
            }
            named.insert(source, name.clone());
        }

        for &source in &self.amp.disabled_sources {
            if !VALID_SOURCES.contains(&source) {
                return Err(AmpError::Config(format!(
                    "amp.disabled_sources: {source} is not a valid source"
                )));
            }
        }

        Ok(VALID_SOURCES
            .map(|id| {
                let name = named.remove(&id).unwrap_or_else(|| format!("Source {id}"));
                let enabled = !self.amp.disabled_sources.contains(&id);
                (id, Source { name, enabled })
            })
            .collect())
    }
}

fn parse_source_id(id: &str) -> Result<SourceId> {
    id.parse::<SourceId>()
        .ok()
        .filter(|source| VALID_SOURCES.contains(source))
        .ok_or_else(|| AmpError::Config(format!("sources.{id}: not a valid source number")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RateOrKeyword {
    Rate(u32),
    Keyword(String),
}

fn rate_from(value: u32) -> std::result::Result<BaudRate, String> {
    BaudRate::try_from(value).map_err(|e| e.to_string())
}

impl<'de> Deserialize<'de> for BaudConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RateOrKeyword::deserialize(deserializer)? {
            RateOrKeyword::Rate(rate) => rate_from(rate).map(BaudConfig::Rate).map_err(de::Error::custom),
            RateOrKeyword::Keyword(k) if k == "auto" => Ok(BaudConfig::Auto),
            RateOrKeyword::Keyword(k) => Err(de::Error::custom(format!(
                "expected a baud rate or \"auto\", got {k:?}"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for AdjustBaud {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RateOrKeyword::deserialize(deserializer)? {
            RateOrKeyword::Rate(rate) => rate_from(rate).map(AdjustBaud::Rate).map_err(de::Error::custom),
            RateOrKeyword::Keyword(k) if k == "off" => Ok(AdjustBaud::Off),
            RateOrKeyword::Keyword(k) if k == "max" => Ok(AdjustBaud::Max),
            RateOrKeyword::Keyword(k) => Err(de::Error::custom(format!(
                "expected a baud rate, \"off\" or \"max\", got {k:?}"
            ))),
        }
    }
}

fn default_read_timeout() -> f64 {
    1.0
}

fn default_baud() -> BaudConfig {
    BaudConfig::Auto
}

fn default_adjust_baud() -> AdjustBaud {
    AdjustBaud::Max
}

fn default_true() -> bool {
    true
}

fn default_mqtt_url() -> String {
    DEFAULT_MQTT_URL.to_string()
}

fn default_client_id() -> String {
    "mwha2mqttd".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_poll_interval() -> f64 {
    0.5
}

fn default_max_consecutive_timeouts() -> u32 {
    5
}

fn default_manufacturer() -> String {
    "Monoprice".to_string()
}

fn default_model() -> String {
    "MPR-6ZHMAUT".to_string()
}
