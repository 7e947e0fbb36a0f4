use nusb::transfer::{Bulk, In, Out, TransferError};
use nusb::{DeviceInfo, Endpoint, Interface, MaybeFuture};
use std::time::{Duration, Instant};

use super::{LineBuffer, Link, Transport, TransportError};
use crate::frame::{decode_float_packet, FLOAT_PACKET_LEN};

/// Identification and endpoint layout of the PSoC USB firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub out_endpoint: u8,
    pub in_endpoint: u8,
    /// Size of one bulk IN read
    pub packet_size: usize,
    pub timeout: Duration,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x04B4,
            product_id: 0x8051,
            interface: 0,
            out_endpoint: 0x02,
            in_endpoint: 0x81,
            packet_size: 40,
            timeout: Duration::from_secs(3),
        }
    }
}

fn usb_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Usb(e.to_string())
}

fn transfer_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Disconnected => TransportError::Disconnected,
        other => usb_error(other),
    }
}

/// Bulk endpoint transport; commands go out raw, replies arrive in fixed-size packets
pub struct UsbTransport {
    _interface: Interface,
    bulk_out: Endpoint<Bulk, Out>,
    bulk_in: Endpoint<Bulk, In>,
    in_pending: bool,
    settings: UsbSettings,
    buffer: LineBuffer,
    link: Link,
    name: String,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("name", &self.name)
            .field("connected", &self.link.is_up())
            .finish()
    }
}

impl UsbTransport {
    /// Open a device found by discovery and claim its bulk endpoints
    pub fn open(info: &DeviceInfo, settings: UsbSettings) -> Result<Self, TransportError> {
        let name = format!(
            "usb {:04x}:{:04x} addr {}",
            info.vendor_id(),
            info.product_id(),
            info.device_address()
        );
        let device = info.open().wait().map_err(usb_error)?;
        let interface = device.claim_interface(settings.interface).wait().map_err(usb_error)?;
        let bulk_out = interface
            .endpoint::<Bulk, Out>(settings.out_endpoint)
            .map_err(usb_error)?;
        let bulk_in = interface
            .endpoint::<Bulk, In>(settings.in_endpoint)
            .map_err(usb_error)?;

        log::info!("Claimed {}", name);
        Ok(Self {
            _interface: interface,
            bulk_out,
            bulk_in,
            in_pending: false,
            settings,
            buffer: LineBuffer::new(),
            link: Link::up(),
            name,
        })
    }

    /// Read one bulk IN packet of at most `len` bytes
    fn read_packet(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.in_pending {
            // IN transfers are requested in whole max-size packets
            let max_packet = self.bulk_in.max_packet_size().max(1);
            let buffer = self.bulk_in.allocate(len.div_ceil(max_packet) * max_packet);
            self.bulk_in.submit(buffer);
            self.in_pending = true;
        }

        // A timed out transfer stays queued and is picked up by the next read
        let completion = self
            .bulk_in
            .wait_next_complete(timeout)
            .ok_or(TransportError::Timeout { waited: timeout })?;
        self.in_pending = false;
        completion.status.map_err(transfer_error)?;
        Ok(completion.buffer[..completion.actual_len].to_vec())
    }

    /// Read the 24-byte packet of six big-endian floats the PSoC sends for a single read
    pub fn read_float_packet(&mut self) -> Result<[f32; 6], TransportError> {
        self.link.ensure_up()?;
        let timeout = self.settings.timeout;
        let result = self.read_packet(FLOAT_PACKET_LEN, timeout);
        let packet = self.link.track(&self.name, result)?;
        decode_float_packet(&packet).map_err(|e| TransportError::Usb(e.to_string()))
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, command: &[u8]) -> Result<(), TransportError> {
        self.link.ensure_up()?;
        log::debug!("{} <- {}", self.name, String::from_utf8_lossy(command));

        self.bulk_out.submit(command.to_vec().into());

        let result = match self.bulk_out.wait_next_complete(self.settings.timeout) {
            Some(completion) => completion.status.map_err(transfer_error),
            None => {
                self.bulk_out.cancel_all();
                Err(usb_error("bulk OUT transfer timed out"))
            }
        };
        self.link.track(&self.name, result)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.link.ensure_up()?;
        let start = Instant::now();

        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(line);
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(TransportError::Timeout { waited: start.elapsed() });
            }

            let packet_size = self.settings.packet_size;
            let result = self.read_packet(packet_size, remaining);
            let packet = self.link.track(&self.name, result)?;
            if let Some(message) = self.buffer.push_packet(&packet, packet_size) {
                return Ok(message);
            }
        }
    }

    fn read_all_available(&mut self) -> Result<Vec<u8>, TransportError> {
        self.link.ensure_up()?;
        let quiet = Duration::from_millis(50);
        let packet_size = self.settings.packet_size;
        loop {
            match self.read_packet(packet_size, quiet) {
                Ok(packet) => self.buffer.push(&packet),
                Err(TransportError::Timeout { .. }) => break,
                Err(e) => return self.link.track(&self.name, Err(e)),
            }
        }
        Ok(self.buffer.take_all())
    }

    fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
