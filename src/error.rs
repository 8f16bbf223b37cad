use thiserror::Error;

/// Result type for amp and bridge operations
pub type Result<T> = std::result::Result<T, AmpError>;

/// Errors that can occur when talking to the amp or bridging it to MQTT
#[derive(Error, Debug)]
pub enum AmpError {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A single byte of a response did not arrive within the read timeout
    #[error("Timeout while reading response for command {command:?}")]
    CommandTimeout {
        /// Command that was in flight
        command: String,
    },

    /// The amp did not echo back the command that was written
    #[error("Serial echoback was not the expected value. Expected {expected:?}, got {got:?}")]
    EchoMismatch { expected: String, got: String },

    /// The amp rejected the command
    #[error("Command error while executing command {command:?}")]
    CommandError { command: String },

    /// A response frame could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No supported baud rate produced a clean echo
    #[error("Unable to detect current baud rate")]
    BaudDetectionFailed,

    /// Empty commands never produced a valid reply
    #[error("Unable to resync serial connection")]
    ResyncFailed,

    /// Baud rate the amp does not support
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaud(u32),

    /// Integer attribute value outside its valid range
    #[error("{attribute}: {value} is not within accepted range {range}")]
    ValueOutOfRange {
        attribute: &'static str,
        value: i64,
        range: String,
    },

    /// Attribute value of the wrong semantic type
    #[error("{attribute}: expected a value of type {expected}")]
    TypeMismatch {
        attribute: &'static str,
        expected: &'static str,
    },

    /// Attribute has no protocol key and cannot be set
    #[error("Attribute {0} cannot be set")]
    NotSettable(&'static str),

    /// Amp/zone address outside the valid ranges
    #[error("Invalid zone address: {0}")]
    InvalidAddress(String),

    /// Attribute name not present in the attribute table
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Publish/subscribe client error
    #[error("PubSub error: {0}")]
    PubSub(String),

    /// Configuration is missing or invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Too many consecutive timeouts and the link could not be recovered
    #[error("Amp link is dead after {timeouts} consecutive timeouts")]
    LinkDead { timeouts: u32 },

    /// A blocking transport task panicked or was cancelled
    #[error("Transport task failed: {0}")]
    TaskFailed(String),
}

impl AmpError {
    /// Errors after which the connection is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmpError::Io(_)
                | AmpError::Serial(_)
                | AmpError::ResyncFailed
                | AmpError::BaudDetectionFailed
                | AmpError::LinkDead { .. }
                | AmpError::TaskFailed(_)
        )
    }

    /// Errors that leave the serial stream out of step with the amp
    pub fn is_desync(&self) -> bool {
        matches!(self, AmpError::EchoMismatch { .. } | AmpError::InvalidResponse(_))
    }
}

impl From<rumqttc::ClientError> for AmpError {
    fn from(e: rumqttc::ClientError) -> Self {
        AmpError::PubSub(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(AmpError::ResyncFailed.is_fatal());
        assert!(AmpError::LinkDead { timeouts: 5 }.is_fatal());
        assert!(!AmpError::CommandError { command: "?11".into() }.is_fatal());

        let echo = AmpError::EchoMismatch {
            expected: "?11".into(),
            got: "?1".into(),
        };
        assert!(echo.is_desync());
        assert!(!echo.is_fatal());
        assert!(!AmpError::CommandTimeout { command: String::new() }.is_desync());
    }
}
