//! Bridge between a multi-zone whole-home audio amplifier and MQTT
//!
//! The amp (Monoprice MPR-6ZHMAUT and compatibles, up to three units daisy
//! chained, six zones each) is controlled over an ASCII serial protocol.
//! This library provides:
//!
//! - Baud rate detection and negotiation
//! - Command framing with echo verification and resync
//! - The zone attribute table and its two digit wire codec
//! - A poll loop that publishes zone state changes as retained messages
//! - Set commands from MQTT applied concurrently with polling
//!
//! # Quick Start
//!
//! ```no_run
//! use mwha_bridge::{AmpConnection, AttributeDescriptor, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("/etc/mwha2mqttd.toml")?;
//!     let amp = AmpConnection::connect(&config.serial).await?;
//!
//!     // Read every zone of amp 1
//!     let snapshot = amp.zone_enquiry("10".parse()?).await?;
//!     for (zone, state) in &snapshot {
//!         for (attribute, value) in state.iter() {
//!             println!("{zone} {attribute} = {value}");
//!         }
//!     }
//!
//!     // Turn zone 12 up
//!     let volume = AttributeDescriptor::by_name("volume")?;
//!     amp.zone_set("12".parse()?, volume, 20.into()).await?;
//!
//!     amp.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Transport**: blocking byte channel (serial device or TCP serial server)
//! - **Protocol**: command framing and response frames
//! - **Connection**: baud handling, resync and zone commands over one locked link
//! - **Zone**: attribute table, value codec and snapshots
//! - **Bridge**: poll, diff and publish loop plus set command handling
//! - **PubSub**: publish/subscribe seam and its MQTT implementation

mod bridge;
mod config;
mod connection;
mod error;
mod protocol;
mod pubsub;
mod transport;
mod types;
mod zone;

// Public exports
pub use bridge::{diff, Bridge, BridgeSettings, Change, TickReport};
pub use config::{AdjustBaud, AmpConfig, BaudConfig, Config, MqttConfig, SerialConfig, Source};
pub use connection::AmpConnection;
pub use error::{AmpError, Result};
pub use protocol::{exchange, read_frame};
pub use pubsub::{MessageHandler, MqttPubSub, PubSub, CONNECTED_PAYLOAD, DISCONNECTED_PAYLOAD};
pub use transport::{SerialTransport, TcpTransport, Transport};
pub use types::{AmpId, BaudRate, Scope, SourceId, ZoneAddress, ZoneNumber};
pub use zone::{
    parse_zone_status, AttributeDescriptor, AttributeValue, ValueType, ZoneSnapshot, ZoneState,
    ZONE_ATTRIBUTES,
};
