//! Serial wire protocol: command framing and response frames
//!
//! Commands are ASCII terminated by CR. The amp echoes each command and ends
//! every response frame with CR LF `#`. A rejected command produces the frame
//! CR LF `Command Error.`.
//!
//! Everything here is blocking and expects the caller to hold exclusive
//! access to the transport for the whole exchange.

use crate::error::{AmpError, Result};
use crate::transport::Transport;
use crate::types::BaudRate;

pub const COMMAND_TERMINATOR: &[u8] = b"\r";
pub const FRAME_TERMINATOR: &[u8] = b"\r\n#";
pub const COMMAND_ERROR_FRAME: &[u8] = b"\r\nCommand Error.";

/// Longest frame accepted, terminator included; a zone status is 26 bytes
pub const MAX_FRAME_LEN: usize = 256;

/// Written during baud detection; the amp echoes it verbatim when the rate is right
pub const BAUD_PROBE: &[u8] = b"baudrate detect";

/// Zone status enquiry for a single zone or a whole amp
pub fn enquiry_command(address: impl std::fmt::Display) -> String {
    format!("?{address}")
}

/// Attribute set command
pub fn set_command(address: impl std::fmt::Display, key: &str, encoded: &str) -> String {
    format!("<{address}{key}{encoded}")
}

/// Baud change command (without terminator)
pub fn baud_command(rate: BaudRate) -> String {
    format!("<{}", rate.value())
}

/// Read one frame, one byte at a time
///
/// Each byte gets the transport's full read timeout, so a slow but steady
/// response never times out; only a stalled byte does.
pub fn read_frame(port: &mut dyn Transport, command: &str) -> Result<String> {
    let mut buffer = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    while !buffer.ends_with(FRAME_TERMINATOR) {
        if port.read(&mut byte)? == 0 {
            return Err(AmpError::CommandTimeout {
                command: command.to_string(),
            });
        }
        buffer.push(byte[0]);

        if buffer.len() > MAX_FRAME_LEN {
            return Err(AmpError::InvalidResponse(format!(
                "no frame terminator within {MAX_FRAME_LEN} bytes for {command:?}"
            )));
        }
    }

    buffer.truncate(buffer.len() - FRAME_TERMINATOR.len());

    if buffer == COMMAND_ERROR_FRAME {
        return Err(AmpError::CommandError {
            command: command.to_string(),
        });
    }

    String::from_utf8(buffer)
        .map_err(|e| AmpError::InvalidResponse(format!("non ASCII frame for {command:?}: {e}")))
}

/// Run one command: write it, verify the echo and collect the response frames
pub fn exchange(port: &mut dyn Transport, command: &str, expected_responses: usize) -> Result<Vec<String>> {
    port.reset_buffers()?;

    tracing::debug!("Sending command {:?}", command);
    let mut raw = Vec::with_capacity(command.len() + 1);
    raw.extend_from_slice(command.as_bytes());
    raw.extend_from_slice(COMMAND_TERMINATOR);
    port.write_all(&raw)?;
    port.flush()?;

    let echo = read_frame(port, command)?;
    if echo != command {
        return Err(AmpError::EchoMismatch {
            expected: command.to_string(),
            got: echo,
        });
    }

    let responses = (0..expected_responses)
        .map(|_| read_frame(port, command))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!("Command {:?} returned {:?}", command, responses);
    Ok(responses)
}

/// Switch the transport to `rate` and check whether the amp echoes the probe cleanly
pub fn probe_baud(port: &mut dyn Transport, rate: BaudRate) -> Result<bool> {
    port.reset_buffers()?;
    port.set_baud(rate)?;

    port.write_all(BAUD_PROBE)?;
    port.flush()?;

    let mut echo = vec![0u8; BAUD_PROBE.len()];
    let mut filled = 0;
    while filled < echo.len() {
        let n = port.read(&mut echo[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if &echo[..filled] == BAUD_PROBE {
        return Ok(true);
    }

    tracing::debug!(
        "Probe echo at {} baud was {:?}",
        rate,
        String::from_utf8_lossy(&echo[..filled])
    );
    Ok(false)
}

/// Ask the amp to change baud, then follow it
///
/// The amp switches the moment it sees the CR, so whatever it replies is
/// garbled. Drain until a read times out before switching locally.
pub fn change_baud(port: &mut dyn Transport, rate: BaudRate) -> Result<()> {
    port.reset_buffers()?;

    let mut raw = baud_command(rate).into_bytes();
    raw.extend_from_slice(COMMAND_TERMINATOR);
    port.write_all(&raw)?;
    port.flush()?;

    let mut scratch = [0u8; 64];
    while port.read(&mut scratch)? > 0 {}

    port.set_baud(rate)
}
