//! Byte transports between the host computer and the sensor controller.
//!
//! A [`Transport`] writes commands and yields `\r\n` terminated response lines.
//! Any I/O failure drops the link: [`Transport::is_connected`] turns false and
//! further writes fail fast with [`TransportError::NotConnected`]. Timeouts are
//! not failures.

use std::time::Duration;

pub mod mock;
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

pub use mock::MockTransport;
pub use serial::{SerialSettings, SerialTransport};
#[cfg(feature = "usb")]
pub use usb::{UsbSettings, UsbTransport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("No complete line received within {waited:?}")]
    Timeout { waited: Duration },

    #[error("Device was disconnected")]
    Disconnected,

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("USB error: {0}")]
    Usb(String),
}

impl TransportError {
    /// Whether the error means the link can no longer be used
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout { .. })
    }
}

/// Uniform read/write contract over USB bulk endpoints or a serial port
pub trait Transport: Send {
    /// Write one command; the transport adds whatever terminator its link needs
    fn write(&mut self, command: &[u8]) -> Result<(), TransportError>;

    /// Block until one full response line is available, without its terminator
    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drain everything the device has sent so far
    fn read_all_available(&mut self) -> Result<Vec<u8>, TransportError>;

    fn is_connected(&self) -> bool;

    /// Short name of the underlying device, for logs
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, command: &[u8]) -> Result<(), TransportError> {
        (**self).write(command)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_line(timeout)
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).read_all_available()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Connectivity flag shared by every transport implementation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Link {
    connected: bool,
}

impl Link {
    pub(crate) fn up() -> Self {
        Self { connected: true }
    }

    pub(crate) fn is_up(&self) -> bool {
        self.connected
    }

    pub(crate) fn ensure_up(&self) -> Result<(), TransportError> {
        if self.connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// Record the outcome of an I/O call, dropping the link on fatal errors
    pub(crate) fn track<T>(&mut self, name: &str, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_fatal() && self.connected {
                log::error!("{}: link lost: {}", name, e);
                self.connected = false;
            }
        }
        result
    }
}

/// Splits a byte stream into lines terminated by `\n`, dropping a preceding `\r`.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, if one is buffered
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Push one fixed-size packet, trimming its NUL padding.
    ///
    /// A packet shorter than `packet_size`, or padded with NULs, ends a message. If
    /// such a packet has no `\n`, everything buffered is returned as one line.
    pub fn push_packet(&mut self, packet: &[u8], packet_size: usize) -> Option<Vec<u8>> {
        let trimmed_len = packet.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let payload = &packet[..trimmed_len];
        self.push(payload);

        let ends_message = packet.len() < packet_size || trimmed_len < packet.len();
        if ends_message && !payload.contains(&b'\n') && !self.is_empty() {
            Some(self.take_all())
        } else {
            None
        }
    }

    /// Take whatever is buffered, complete or not
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"AS7262 START");
        assert_eq!(buffer.next_line(), None);
        buffer.push(b" READ\r\nAS7262 RAW");
        assert_eq!(buffer.next_line(), Some(b"AS7262 START READ".to_vec()));
        assert_eq!(buffer.next_line(), None);
        buffer.push(b" DATA: [1]\r\n\r\n");
        assert_eq!(buffer.next_line(), Some(b"AS7262 RAW DATA: [1]".to_vec()));
        assert_eq!(buffer.next_line(), Some(Vec::new()));
        assert!(buffer.is_empty());
    }

    fn padded(text: &[u8], size: usize) -> Vec<u8> {
        let mut packet = text.to_vec();
        packet.resize(size, 0);
        packet
    }

    #[test]
    fn test_padded_packet_is_a_whole_message() {
        let mut buffer = LineBuffer::new();
        let reply = buffer.push_packet(&padded(b"PSoC-Spectrometer", 40), 40);
        assert_eq!(reply, Some(b"PSoC-Spectrometer".to_vec()));
        assert!(buffer.is_empty());

        // short read, no padding
        assert_eq!(buffer.push_packet(b"AS7262", 40), Some(b"AS7262".to_vec()));
    }

    #[test]
    fn test_line_split_over_two_packets() {
        let line = b"AS7262 RAW DATA: [1000,2000,3000,4000,5000,600]\r\n";
        assert_eq!(line.len(), 49);

        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_packet(&line[..40], 40), None);
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.push_packet(&line[40..], 40), None);
        assert_eq!(
            buffer.next_line(),
            Some(b"AS7262 RAW DATA: [1000,2000,3000,4000,5000,600]".to_vec())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_packet_with_line_and_partial_next() {
        let packet = b"AS7262 START READ\r\nAS7262 RAW DATA: [1,2";
        assert_eq!(packet.len(), 40);

        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_packet(packet, 40), None);
        assert_eq!(buffer.next_line(), Some(b"AS7262 START READ".to_vec()));
        assert_eq!(buffer.next_line(), None);

        assert_eq!(buffer.push_packet(&padded(b",3,4,5,6]\r\n", 40), 40), None);
        assert_eq!(buffer.next_line(), Some(b"AS7262 RAW DATA: [1,2,3,4,5,6]".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_link_drops_on_fatal_error_only() {
        let mut link = Link::up();
        let timeout: Result<(), _> = Err(TransportError::Timeout {
            waited: Duration::from_millis(5),
        });
        assert!(link.track("test", timeout).is_err());
        assert!(link.is_up());

        let io: Result<(), _> = Err(TransportError::Io(std::io::Error::other("unplugged")));
        assert!(link.track("test", io).is_err());
        assert!(!link.is_up());
        assert!(matches!(link.ensure_up(), Err(TransportError::NotConnected)));
    }
}
