use crate::error::{AmpError, Result};
use crate::types::BaudRate;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Byte oriented duplex channel to the amp
///
/// Reads block for at most the configured timeout and return `Ok(0)` when
/// nothing arrived in time.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means the read timed out
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Discard anything pending in the input and output buffers
    fn reset_buffers(&mut self) -> Result<()>;

    /// Change the local baud rate without reopening the channel
    fn set_baud(&mut self, rate: BaudRate) -> Result<()>;
}

/// Open a transport for a port string
///
/// `tcp://host:port` connects to an IP serial server, anything else is a
/// local serial device path.
pub fn open(port: &str, baud: BaudRate, read_timeout: Duration) -> Result<Box<dyn Transport>> {
    match port.strip_prefix("tcp://") {
        Some(address) => Ok(Box::new(TcpTransport::connect(address, read_timeout)?)),
        None => Ok(Box::new(SerialTransport::open(port, baud, read_timeout)?)),
    }
}

/// Local serial device, 8N1 without flow control
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: BaudRate, read_timeout: Duration) -> Result<Self> {
        tracing::info!("Opening serial port {} at {} baud", path, baud);

        let port = serialport::new(path, baud.value())
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn reset_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn set_baud(&mut self, rate: BaudRate) -> Result<()> {
        self.port.set_baud_rate(rate.value())?;
        Ok(())
    }
}

/// Amp reached through a raw TCP serial server
pub struct TcpTransport {
    stream: TcpStream,
    read_timeout: Duration,
}

impl TcpTransport {
    pub fn connect(address: &str, read_timeout: Duration) -> Result<Self> {
        tracing::info!("Connecting to serial server at {}", address);

        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(read_timeout))?;

        Ok(Self {
            stream,
            read_timeout,
        })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(AmpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial server closed the connection",
            ))),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    fn reset_buffers(&mut self) -> Result<()> {
        self.stream.set_nonblocking(true)?;

        let mut scratch = [0u8; 256];
        let drained = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(self.read_timeout))?;
        drained?;
        Ok(())
    }

    fn set_baud(&mut self, rate: BaudRate) -> Result<()> {
        tracing::debug!("Ignoring local baud change to {} on TCP transport", rate);
        Ok(())
    }
}
