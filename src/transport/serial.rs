use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use super::{LineBuffer, Link, Transport, TransportError};

/// Line settings for the UART link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub timeout: Duration,
}

impl SerialSettings {
    pub const BAUD_RATE: u32 = 115_200;

    /// WiPy / Arduino hosts behind an FTDI bridge: 8N1
    pub fn micropython() -> Self {
        Self {
            baud_rate: Self::BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }

    /// PSoC UART: 8E1
    pub fn psoc() -> Self {
        Self {
            parity: Parity::Even,
            ..Self::micropython()
        }
    }

    pub fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::micropython()
    }
}

/// Floor for a single port read; some backends treat a zero timeout as non-blocking
const MIN_CHUNK_TIMEOUT: Duration = Duration::from_millis(1);

/// How long one port read may block when `remaining` is left of the caller's deadline
fn chunk_timeout(remaining: Duration, port_timeout: Duration) -> Duration {
    remaining.min(port_timeout).max(MIN_CHUNK_TIMEOUT)
}

/// Serial port transport: commands end with `\r`, responses with `\r\n`
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
    port_name: String,
    /// Timeout the port was opened with, upper bound for a single chunk read
    port_timeout: Duration,
    buffer: LineBuffer,
    link: Link,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("connected", &self.link.is_up())
            .finish()
    }
}

impl SerialTransport {
    /// Open `port` with the given line settings
    pub fn open(port: &str, settings: &SerialSettings) -> Result<Self, TransportError> {
        let serial = serialport::new(port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(settings.timeout)
            .open()?;

        log::debug!("Opened {} at {} baud", port, settings.baud_rate);
        Ok(Self::from_port(serial))
    }

    /// Wrap an already opened port
    pub fn from_port(serial: Box<dyn SerialPort>) -> Self {
        let port_name = serial.name().unwrap_or_else(|| "serial".to_string());
        let port_timeout = serial.timeout();
        Self {
            serial,
            port_name,
            port_timeout,
            buffer: LineBuffer::new(),
            link: Link::up(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Discard anything buffered on either side of the link
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.buffer.take_all();
        let result = self.serial.clear(serialport::ClearBuffer::All).map_err(TransportError::from);
        self.link.track(&self.port_name, result)
    }

    /// Read one chunk, blocking at most `timeout`; `Ok(0)` means the port had nothing to say
    fn read_chunk(&mut self, timeout: Duration) -> Result<usize, TransportError> {
        let timeout = chunk_timeout(timeout, self.port_timeout);
        if self.serial.timeout() != timeout {
            self.serial.set_timeout(timeout)?;
        }
        let mut chunk = [0u8; 64];
        match self.serial.read(&mut chunk) {
            Ok(n) => {
                self.buffer.push(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, command: &[u8]) -> Result<(), TransportError> {
        self.link.ensure_up()?;
        log::debug!("{} <- {}", self.port_name, String::from_utf8_lossy(command));

        let mut framed = Vec::with_capacity(command.len() + 1);
        framed.extend_from_slice(command);
        framed.push(b'\r');

        let result = self
            .serial
            .write_all(&framed)
            .and_then(|_| self.serial.flush())
            .map_err(TransportError::from);
        self.link.track(&self.port_name, result)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.link.ensure_up()?;
        let start = Instant::now();

        loop {
            if let Some(line) = self.buffer.next_line() {
                log::trace!("{} -> {}", self.port_name, String::from_utf8_lossy(&line));
                return Ok(line);
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    waited: start.elapsed(),
                });
            }
            let result = self.read_chunk(remaining);
            self.link.track(&self.port_name, result)?;
        }
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, TransportError> {
        self.link.ensure_up()?;
        loop {
            let result = self.read_chunk(self.port_timeout);
            if self.link.track(&self.port_name, result)? == 0 {
                break;
            }
        }
        Ok(self.buffer.take_all())
    }

    fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_presets() {
        let mp = SerialSettings::micropython();
        assert_eq!(mp.baud_rate, 115_200);
        assert_eq!(mp.parity, Parity::None);
        assert_eq!(mp.timeout, Duration::from_secs(1));

        let psoc = SerialSettings::psoc();
        assert_eq!(psoc.parity, Parity::Even);
        assert_eq!(psoc.stop_bits, StopBits::One);
        assert_eq!(psoc.data_bits, DataBits::Eight);
    }

    #[test]
    fn test_chunk_timeout_follows_caller_deadline() {
        let port = Duration::from_secs(1);
        assert_eq!(chunk_timeout(Duration::from_millis(50), port), Duration::from_millis(50));
        assert_eq!(chunk_timeout(Duration::from_secs(5), port), port);
        assert_eq!(chunk_timeout(Duration::from_micros(10), port), MIN_CHUNK_TIMEOUT);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialTransport::open("/dev/does-not-exist-spectro", &SerialSettings::default());
        assert!(result.is_err());
    }
}
