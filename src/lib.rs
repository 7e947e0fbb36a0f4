//! # Spectro Link
//!
//! A Rust library for talking to AS7262 / AS7263 / AS7265x color sensors that sit
//! behind a PSoC or MicroPython (WiPy / Arduino) host controller.
//!
//! The host speaks a line based text protocol over USB bulk endpoints or a UART.
//! This crate finds the host, checks who it is, sends commands and turns the
//! stream of response lines into typed [`Reading`]s.
//!
//! ## Features
//!
//! - **Device discovery**: Uses `serialport` to match port descriptions, `nusb` for the PSoC USB firmware
//! - **Frame parsing**: Tagged line grammar with recovery from malformed or interrupted frames
//! - **Readings**: Saturation flag, normalized counts and wavelength ordering for the 18 channel AS7265x
//! - **Settings**: Gain, integration time and LEDs rendered in either host dialect
//! - **Background reads**: A worker thread with a single slot handoff and cooperative cancellation
//! - **DataFrame output**: Uses `polars` to hand readings to collaborators
//!
//! ## Examples
//!
//! ### Connect and read
//!
//! ```rust,no_run
//! use spectro_link::{Session, SessionConfig, SerialSettings, DESCRIPTOR_PATTERNS};
//! use std::time::Duration;
//!
//! let session = Session::connect_serial(
//!     &DESCRIPTOR_PATTERNS,
//!     &SerialSettings::psoc(),
//!     SessionConfig::psoc(),
//! )?;
//! let sensor = session.attached_sensor()?;
//!
//! let reading = session.read_one(sensor, Duration::from_secs(3))?;
//! println!("{:?} saturated: {}", reading.norm_data(), reading.saturated());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Parsing lines without a device
//!
//! ```rust
//! use spectro_link::{ReadingAssembler, Step, Gain};
//!
//! let mut assembler = ReadingAssembler::new();
//! let lines = [
//!     "AS7262 START READ",
//!     "AS7262 RAW DATA: [100,200,300,400,500,600]",
//!     "integration cycles:50|x|16|",
//!     "AS7262 CAL DATA: [10,20,30,40,50,60]",
//!     "AS7262 END READ",
//! ];
//! let mut reading = None;
//! for line in lines {
//!     if let Step::Complete(r) = assembler.push_line(line.as_bytes()) {
//!         reading = Some(r);
//!     }
//! }
//! let reading = reading.expect("frame completes");
//! assert_eq!(reading.gain(), Gain::X16);
//! assert!(!reading.saturated());
//! ```
//!
//! ### Settings
//!
//! ```rust
//! use spectro_link::{Dialect, Gain, SensorKind, SensorSettings};
//!
//! let settings = SensorSettings::builder()
//!     .gain(Gain::X16)
//!     .integration_time_ms(100.0)
//!     .build()
//!     .unwrap();
//!
//! let command = Dialect::Psoc.set_gain(SensorKind::As7262, settings.gain);
//! assert_eq!(command.as_str(), "AS7262|GAIN|2");
//! ```
//!
//! ### Continuous reads on a worker thread
//!
//! ```rust,no_run
//! use spectro_link::{CancelToken, ReadWorker, SensorKind, Session, SessionConfig, SerialSettings};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let session = Arc::new(Session::open_serial("/dev/ttyUSB0", &SerialSettings::psoc(), SessionConfig::psoc())?);
//! let worker = ReadWorker::spawn(session, SensorKind::As7262, Duration::from_secs(1), CancelToken::new())?;
//!
//! for _ in 0..10 {
//!     if let Some(result) = worker.recv_timeout(Duration::from_secs(5)) {
//!         println!("{:?}", result?.calibrated_data());
//!     }
//! }
//! worker.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod assembler;
pub mod discovery;
pub mod frame;
pub mod reading;
pub mod sensor;
pub mod session;
pub mod settings;
pub mod transport;
pub mod worker;

// Re-export the main types for convenience
pub use assembler::{AbortReason, ReadingAssembler, Step};

pub use discovery::{find_device, find_serial_device, DiscoveryError, PortCandidate, DESCRIPTOR_PATTERNS};

pub use frame::{classify, FrameError, LineKind};

pub use reading::Reading;

pub use sensor::{SensorDescriptor, SensorKind};

pub use session::{DeviceIdentity, Session, SessionConfig, SessionError};

pub use settings::{Command, Dialect, Gain, LedCurrent, LedSelection, OnboardLed, SensorSettings, SettingsError};

pub use transport::{MockTransport, SerialSettings, SerialTransport, Transport, TransportError};
#[cfg(feature = "usb")]
pub use transport::{UsbSettings, UsbTransport};

pub use worker::{CancelToken, ReadWorker};
