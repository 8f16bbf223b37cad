use crate::config::{AdjustBaud, BaudConfig, SerialConfig};
use crate::error::{AmpError, Result};
use crate::protocol;
use crate::transport::{self, Transport};
use crate::types::{BaudRate, ZoneAddress};
use crate::zone::{parse_zone_status, AttributeDescriptor, AttributeValue, ZoneSnapshot};
use std::sync::{Arc, Mutex};

const RESYNC_ATTEMPTS: usize = 4;

/// Transport plus the baud rate it is currently set to
struct Link {
    transport: Box<dyn Transport>,
    baud: BaudRate,
}

/// Connection to one amp over a serial transport
///
/// The amp has no request identifiers, so every exchange holds the link
/// lock from the first written byte to the last frame read. Transport I/O
/// runs on the blocking pool; a command whose caller goes away still runs
/// to completion so the byte stream stays in step.
pub struct AmpConnection {
    link: Arc<Mutex<Link>>,
    /// Baud in effect when the connection was opened
    open_baud: BaudRate,
    reset_baud: bool,
}

impl AmpConnection {
    /// Open the configured port and bring the link up
    pub async fn connect(config: &SerialConfig) -> Result<Self> {
        let initial = match config.baud {
            BaudConfig::Auto => BaudRate::DEFAULT,
            BaudConfig::Rate(rate) => rate,
        };

        let port = config.port.clone();
        let read_timeout = config.read_timeout();
        let transport = tokio::task::spawn_blocking(move || transport::open(&port, initial, read_timeout))
            .await
            .map_err(|e| AmpError::TaskFailed(e.to_string()))??;

        Self::open(transport, config).await
    }

    /// Bring up a link over an already opened transport
    ///
    /// Detects or sets the baud, optionally negotiates a faster one and
    /// resyncs the command stream.
    pub async fn open(transport: Box<dyn Transport>, config: &SerialConfig) -> Result<Self> {
        let mut connection = Self {
            link: Arc::new(Mutex::new(Link {
                transport,
                baud: BaudRate::DEFAULT,
            })),
            open_baud: BaudRate::DEFAULT,
            reset_baud: config.reset_baud,
        };

        let open_baud = match config.baud {
            BaudConfig::Auto => connection.detect_baud().await?,
            BaudConfig::Rate(rate) => {
                connection
                    .with_link(move |link| {
                        link.transport.set_baud(rate)?;
                        link.baud = rate;
                        Ok(())
                    })
                    .await?;
                connection.resync().await?;
                rate
            }
        };
        connection.open_baud = open_baud;

        let target = match config.adjust_baud {
            AdjustBaud::Off => None,
            AdjustBaud::Max => Some(BaudRate::max()),
            AdjustBaud::Rate(rate) => Some(rate),
        };

        match target {
            Some(rate) if rate != open_baud => connection.set_baud(rate).await?,
            Some(_) => tracing::debug!("Amp already at {} baud, not adjusting", open_baud),
            None => {}
        }

        Ok(connection)
    }

    /// Run `f` against the link on the blocking pool, holding the link lock
    async fn with_link<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Link) -> Result<T> + Send + 'static,
    {
        let link = self.link.clone();
        tokio::task::spawn_blocking(move || {
            let mut link = link
                .lock()
                .map_err(|_| AmpError::TaskFailed("amp link lock poisoned".to_string()))?;
            f(&mut link)
        })
        .await
        .map_err(|e| AmpError::TaskFailed(e.to_string()))?
    }

    /// Baud rate the link is currently using
    pub async fn baud(&self) -> Result<BaudRate> {
        self.with_link(|link| Ok(link.baud)).await
    }

    /// Baud rate in effect when the connection was opened
    pub fn open_baud(&self) -> BaudRate {
        self.open_baud
    }

    /// Find the rate the amp is currently using
    ///
    /// The amp is at 9600 after power on, but a session that ended abruptly
    /// can leave it faster. Each supported rate is tried in ascending order
    /// until the amp echoes a probe string back intact.
    pub async fn detect_baud(&self) -> Result<BaudRate> {
        let detected = self
            .with_link(|link| {
                for rate in BaudRate::ALL {
                    tracing::info!("Trying baud rate {}", rate);
                    link.baud = rate;
                    if protocol::probe_baud(link.transport.as_mut(), rate)? {
                        return Ok(rate);
                    }
                }
                Err(AmpError::BaudDetectionFailed)
            })
            .await?;

        tracing::info!("Detected current baud rate as {}", detected);
        self.resync().await?;

        Ok(detected)
    }

    /// Switch both the amp and the local transport to `rate`
    pub async fn set_baud(&self, rate: BaudRate) -> Result<()> {
        tracing::info!("Setting baud rate to {}", rate);

        self.with_link(move |link| {
            protocol::change_baud(link.transport.as_mut(), rate)?;
            link.baud = rate;
            Ok(())
        })
        .await?;

        self.resync().await
    }

    /// Re-align the command stream by sending empty commands until one gets a clean reply
    pub async fn resync(&self) -> Result<()> {
        tracing::debug!("Resyncing serial connection");

        for attempt in 1..=RESYNC_ATTEMPTS {
            match self.execute_command("", 0).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!("Resync attempt {} failed: {}", attempt, e),
            }
        }

        Err(AmpError::ResyncFailed)
    }

    /// Send a command and return the frames that follow its echo
    pub async fn execute_command(&self, command: impl Into<String>, expected_responses: usize) -> Result<Vec<String>> {
        let command = command.into();
        self.with_link(move |link| protocol::exchange(link.transport.as_mut(), &command, expected_responses))
            .await
    }

    /// Read the status of one zone, or of every zone on an amp
    pub async fn zone_enquiry(&self, address: ZoneAddress) -> Result<ZoneSnapshot> {
        let expected = if address.is_all_zones() { 6 } else { 1 };
        let queried = address.zones();

        let mut snapshot = ZoneSnapshot::new();
        for frame in self.execute_command(protocol::enquiry_command(address), expected).await? {
            let (zone, state) = parse_zone_status(&frame)?;
            if queried.contains(&zone) {
                snapshot.insert(zone, state);
            } else {
                tracing::warn!("Ignoring status for zone {} in reply to enquiry for {}", zone, address);
            }
        }

        Ok(snapshot)
    }

    /// Set an attribute on one zone, or on every zone of an amp
    pub async fn zone_set(
        &self,
        address: ZoneAddress,
        attribute: &'static AttributeDescriptor,
        value: AttributeValue,
    ) -> Result<()> {
        let key = attribute.key.ok_or(AmpError::NotSettable(attribute.name))?;
        let encoded = attribute.encode(value)?;

        self.execute_command(protocol::set_command(address, key, &encoded), 0)
            .await?;
        Ok(())
    }

    /// Restore the original baud if configured to
    ///
    /// Runs under the link lock like any other command, so it waits for an
    /// in-flight command and works while other tasks still hold the
    /// connection. The transport is released when the last handle drops.
    /// Restoration failures are logged, never returned.
    pub async fn close(&self) {
        if self.reset_baud {
            match self.baud().await {
                Ok(current) if current != self.open_baud => {
                    tracing::info!("Resetting baud rate to {}", self.open_baud);
                    if let Err(e) = self.set_baud(self.open_baud).await {
                        tracing::error!("Failed to reset baud rate: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to reset baud rate: {}", e),
            }
        }

        tracing::info!("Closing amp connection");
    }
}
