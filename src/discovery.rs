use serialport::{SerialPortInfo, SerialPortType};

use crate::transport::{SerialSettings, SerialTransport, TransportError};
#[cfg(feature = "usb")]
use crate::transport::{UsbSettings, UsbTransport};

/// Port descriptions of the UART bridges the host boards ship with.
///
/// Windows and macOS name the same FTDI/Cypress bridges differently, so every
/// entry is tried.
pub const DESCRIPTOR_PATTERNS: [&str; 4] = [
    "USB Serial Port",
    "USB Serial Device",
    "FT230X Basic UART",
    "Expansion3",
];

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No device matching {patterns:?} found. Please connect a sensor host or specify the port manually")]
    DeviceNotFound { patterns: Vec<String> },
}

impl DiscoveryError {
    fn not_found(patterns: &[&str]) -> Self {
        DiscoveryError::DeviceNotFound {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// A system communication port and its human readable description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub port: String,
    pub description: String,
}

impl PortCandidate {
    pub fn new(port: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            description: description.into(),
        }
    }

    /// Whether the description contains any of `patterns`
    pub fn matches(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.description.contains(p))
    }
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        let description = match &info.port_type {
            SerialPortType::UsbPort(usb) => [usb.product.as_deref(), usb.manufacturer.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" "),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::Unknown => String::new(),
        };
        Self::new(info.port_name, description)
    }
}

/// Enumerate every serial port the OS reports
pub fn available_ports() -> Result<Vec<PortCandidate>, DiscoveryError> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(PortCandidate::from).collect())
}

/// Open the first port whose description matches one of `patterns`.
///
/// Ports that fail to open (busy, no permission) are skipped. The device on the
/// other end is not verified here; that is the session handshake's job.
pub fn find_device<T, E, F>(
    patterns: &[&str],
    ports: &[PortCandidate],
    mut open: F,
) -> Result<(PortCandidate, T), DiscoveryError>
where
    E: std::fmt::Display,
    F: FnMut(&PortCandidate) -> Result<T, E>,
{
    for candidate in ports.iter().filter(|c| c.matches(patterns)) {
        log::debug!("Trying {} ({})", candidate.port, candidate.description);
        match open(candidate) {
            Ok(handle) => {
                log::info!("Opened {} ({})", candidate.port, candidate.description);
                return Ok((candidate.clone(), handle));
            }
            Err(e) => log::warn!("Could not open {}: {}", candidate.port, e),
        }
    }
    Err(DiscoveryError::not_found(patterns))
}

/// Scan the system ports and open the first matching one at `settings`
pub fn find_serial_device(
    patterns: &[&str],
    settings: &SerialSettings,
) -> Result<SerialTransport, DiscoveryError> {
    let ports = available_ports()?;
    log::debug!("Scanning {} serial ports", ports.len());
    let (_, transport) = find_device(patterns, &ports, |c| SerialTransport::open(&c.port, settings))?;
    Ok(transport)
}

/// Locate the PSoC firmware on the USB bus by vendor/product id
#[cfg(feature = "usb")]
pub fn find_usb_device(settings: &UsbSettings) -> Result<nusb::DeviceInfo, DiscoveryError> {
    use nusb::MaybeFuture;

    let mut devices = nusb::list_devices()
        .wait()
        .map_err(|e| TransportError::Usb(format!("Failed to list USB devices: {}", e)))?;

    devices
        .find(|d| d.vendor_id() == settings.vendor_id && d.product_id() == settings.product_id)
        .ok_or_else(|| DiscoveryError::DeviceNotFound {
            patterns: vec![format!("{:04x}:{:04x}", settings.vendor_id, settings.product_id)],
        })
}

/// Find and claim the PSoC firmware's bulk endpoints
#[cfg(feature = "usb")]
pub fn open_usb_device(settings: UsbSettings) -> Result<UsbTransport, DiscoveryError> {
    let info = find_usb_device(&settings)?;
    Ok(UsbTransport::open(&info, settings)?)
}
