//! Command/response protocol with one sensor host.
//!
//! The protocol is half duplex: every exchange holds the transport lock from the
//! command write until the last response line, so a [`Session`] can be shared
//! between threads behind an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::assembler::{AbortReason, ReadingAssembler, Step};
use crate::discovery::{self, DiscoveryError};
use crate::frame::{classify_str, clean_line, LineKind, PSOC_SIGNATURE};
use crate::reading::{Reading, MS_PER_INTEGRATION_CYCLE};
use crate::sensor::{parse_setup_lines, SensorDescriptor, SensorKind};
use crate::settings::{Command, Dialect, Gain, OnboardLed, SensorSettings, SettingsError};
use crate::transport::{SerialSettings, SerialTransport, Transport, TransportError};
#[cfg(feature = "usb")]
use crate::transport::{UsbSettings, UsbTransport};

const END_SETUP_MARKER: &str = "End Setup";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Device answered '{received}' instead of '{expected}'")]
    IdentityMismatch { expected: String, received: String },

    #[error("{sensor} frame ended without {missing}")]
    IncompleteFrame {
        sensor: SensorKind,
        missing: &'static str,
    },

    #[error("No END READ within {waited:?}, device not responding")]
    DeviceTimeout { waited: Duration },

    #[error("No sensor attached to the host")]
    NoSensor,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
}

impl SessionError {
    /// Whether the same request may succeed if tried again on this session
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::IncompleteFrame { .. } | SessionError::DeviceTimeout { .. } => true,
            SessionError::Transport(e) => !e.is_fatal(),
            _ => false,
        }
    }
}

/// What the handshake learned about the other end of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Reply to `ID`; `None` when the host is not asked for one
    pub signature: Option<String>,
    /// Sensor behind the host, `None` if none answered `ID-Spectrometer`
    pub sensor: Option<SensorDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub dialect: Dialect,
    /// Reply expected to `ID`; `None` skips that step for hosts that don't implement it
    pub expected_signature: Option<String>,
    /// Upper bound on one whole read cycle
    pub read_timeout: Duration,
    /// How long to wait for a single handshake or setup line
    pub line_timeout: Duration,
}

impl SessionConfig {
    pub fn psoc() -> Self {
        Self {
            dialect: Dialect::Psoc,
            expected_signature: Some(PSOC_SIGNATURE.to_string()),
            read_timeout: Duration::from_secs(5),
            line_timeout: Duration::from_secs(1),
        }
    }

    pub fn micropython() -> Self {
        Self {
            dialect: Dialect::MicroPython,
            expected_signature: None,
            ..Self::psoc()
        }
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    pub fn expected_signature(mut self, signature: Option<&str>) -> Self {
        self.expected_signature = signature.map(str::to_string);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::psoc()
    }
}

/// One logical session over an exclusively owned transport
pub struct Session<T: Transport> {
    transport: Mutex<T>,
    config: SessionConfig,
    settings: Mutex<SensorSettings>,
    identity: Mutex<Option<DeviceIdentity>>,
    connected: AtomicBool,
    continuous: AtomicBool,
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session<SerialTransport> {
    /// Find a host on the serial ports and perform the handshake
    pub fn connect_serial(
        patterns: &[&str],
        serial: &SerialSettings,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let transport = discovery::find_serial_device(patterns, serial)?;
        let session = Self::new(transport, config);
        session.identify()?;
        Ok(session)
    }

    /// Open a known port and perform the handshake
    pub fn open_serial(
        port: &str,
        serial: &SerialSettings,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let transport = SerialTransport::open(port, serial)?;
        let session = Self::new(transport, config);
        session.identify()?;
        Ok(session)
    }
}

#[cfg(feature = "usb")]
impl Session<UsbTransport> {
    /// Claim the PSoC firmware on the USB bus and perform the handshake
    pub fn connect_usb(usb: UsbSettings, config: SessionConfig) -> Result<Self, SessionError> {
        let transport = discovery::open_usb_device(usb)?;
        let session = Self::new(transport, config);
        session.identify()?;
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    /// Wrap a transport; the session stays unusable until [`Session::identify`] succeeds
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            config,
            settings: Mutex::new(SensorSettings::default()),
            identity: Mutex::new(None),
            connected: AtomicBool::new(false),
            continuous: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && lock(&self.transport).is_connected()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.identity).clone()
    }

    /// Kind of the sensor found by the last handshake
    pub fn attached_sensor(&self) -> Result<SensorKind, SessionError> {
        lock(&self.identity)
            .as_ref()
            .and_then(|id| id.sensor.as_ref())
            .map(|s| s.kind)
            .ok_or(SessionError::NoSensor)
    }

    /// Snapshot of the settings the next read will use
    pub fn settings(&self) -> SensorSettings {
        lock(&self.settings).clone()
    }

    /// Replace the settings without telling the device
    pub fn update_settings(&self, settings: SensorSettings) {
        *lock(&self.settings) = settings;
    }

    /// Run a transport call, dropping the session on fatal errors
    fn io<R>(&self, result: Result<R, TransportError>) -> Result<R, SessionError> {
        if let Err(e) = &result {
            if e.is_fatal() && self.connected.swap(false, Ordering::SeqCst) {
                log::error!("Session lost its device: {}", e);
            }
        }
        Ok(result?)
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }

    fn write_locked(&self, transport: &mut T, command: &Command) -> Result<(), SessionError> {
        log::debug!("Sending {}", command);
        self.io(transport.write(command.as_str().as_bytes()))
    }

    /// Wait for the next non-empty line; `None` if nothing arrives in time
    fn read_reply(&self, transport: &mut T) -> Result<Option<String>, SessionError> {
        let start = Instant::now();
        loop {
            let remaining = self.config.line_timeout.saturating_sub(start.elapsed());
            match transport.read_line(remaining) {
                Ok(line) => {
                    let text = clean_line(&line);
                    if !text.is_empty() {
                        return Ok(Some(text));
                    }
                }
                Err(TransportError::Timeout { .. }) => return Ok(None),
                Err(e) => return self.io(Err(e)),
            }
        }
    }

    /// Handshake: check the host signature, then ask which sensor is attached.
    ///
    /// A signature mismatch leaves the session disconnected. A missing sensor reply
    /// is not an error; the host stays usable and can be probed again.
    #[tracing::instrument(skip(self))]
    pub fn identify(&self) -> Result<DeviceIdentity, SessionError> {
        let mut transport = lock(&self.transport);
        if !transport.is_connected() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::NotConnected.into());
        }

        let stale = self.io(transport.read_all_available())?;
        if !stale.is_empty() {
            log::debug!("Discarded {} stale bytes before handshake", stale.len());
        }

        let dialect = self.config.dialect;
        let signature = match &self.config.expected_signature {
            Some(expected) => {
                self.write_locked(&mut transport, &dialect.identify())?;
                let received = self.read_reply(&mut transport)?.unwrap_or_default();
                if received != *expected {
                    self.connected.store(false, Ordering::SeqCst);
                    *lock(&self.identity) = None;
                    log::error!("{} is not a {} (got '{}')", transport.describe(), expected, received);
                    return Err(SessionError::IdentityMismatch {
                        expected: expected.clone(),
                        received,
                    });
                }
                log::debug!("{} identified as {}", transport.describe(), received);
                Some(received)
            }
            None => None,
        };
        self.connected.store(true, Ordering::SeqCst);

        self.write_locked(&mut transport, &dialect.identify_sensor())?;
        let sensor = self
            .read_reply(&mut transport)?
            .and_then(|reply| match classify_str(&reply) {
                Ok(LineKind::IdentificationReply(text)) => SensorKind::from_tag(&text),
                _ => None,
            })
            .map(|kind| SensorDescriptor::new(kind, false, None));
        match &sensor {
            Some(s) => log::info!("{} attached", s.kind),
            None => log::warn!("No sensor answered on {}", transport.describe()),
        }
        if let Some(init) = dialect.init_objects() {
            self.write_locked(&mut transport, &init)?;
        }

        let identity = DeviceIdentity { signature, sensor };
        *lock(&self.identity) = Some(identity.clone());
        Ok(identity)
    }

    /// Write one raw command line
    pub fn send_command(&self, text: &str) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let mut transport = lock(&self.transport);
        self.write_locked(&mut transport, &Command::new(text))
    }

    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let mut transport = lock(&self.transport);
        self.write_locked(&mut transport, &command)
    }

    /// Push every field of `settings` the host has a command for and keep them for later reads.
    ///
    /// MicroPython hosts only take the gain; integration time and LEDs go out with each read.
    pub fn apply_settings(&self, kind: SensorKind, settings: SensorSettings) -> Result<(), SessionError> {
        let dialect = self.config.dialect;
        self.send(dialect.set_gain(kind, settings.gain))?;
        let optional = [
            dialect.set_integration_time(kind, &settings),
            dialect.led_current(kind, settings.led_current),
            dialect.led_power(kind, settings.led_on),
        ];
        for command in optional.into_iter().flatten() {
            self.send(command)?;
        }
        self.update_settings(settings);
        Ok(())
    }

    pub fn set_gain(&self, kind: SensorKind, gain: Gain) -> Result<(), SessionError> {
        self.send(self.config.dialect.set_gain(kind, gain))?;
        lock(&self.settings).gain = gain;
        Ok(())
    }

    pub fn set_integration_time(&self, kind: SensorKind, ms: f64) -> Result<(), SessionError> {
        let current = self.settings();
        let settings = SensorSettings::builder()
            .gain(current.gain)
            .integration_time_ms(ms)
            .leds(current.leds)
            .led_current(current.led_current)
            .led_on(current.led_on)
            .read_period(current.read_period)
            .build()?;
        self.push_integration_time(kind, &settings)?;
        self.update_settings(settings);
        Ok(())
    }

    /// Send the integration time of `settings` if the host keeps one between reads
    fn push_integration_time(&self, kind: SensorKind, settings: &SensorSettings) -> Result<(), SessionError> {
        match self.config.dialect.set_integration_time(kind, settings) {
            Ok(command) => self.send(command),
            Err(SettingsError::Unsupported { .. }) => self.ensure_connected(),
            Err(e) => Err(e.into()),
        }
    }

    /// Switch the sensor's indicator LED; MicroPython hosts only
    pub fn set_indicator(&self, kind: SensorKind, on: bool) -> Result<(), SessionError> {
        self.send(self.config.dialect.indicator(kind, on)?)
    }

    /// MicroPython hosts only
    pub fn set_onboard_led(&self, led: OnboardLed, on: bool) -> Result<(), SessionError> {
        self.send(self.config.dialect.onboard_led(led, on)?)
    }

    /// Ask a multi-sensor host which sensors sit on its bus
    #[tracing::instrument(skip(self))]
    pub fn probe_bus(&self) -> Result<Vec<SensorDescriptor>, SessionError> {
        self.ensure_connected()?;
        let mut transport = lock(&self.transport);
        self.write_locked(&mut transport, &self.config.dialect.bus_setup())?;

        let deadline = Instant::now() + self.config.read_timeout;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::DeviceTimeout {
                    waited: self.config.read_timeout,
                });
            }
            let line = match transport.read_line(remaining) {
                Ok(line) => clean_line(&line),
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => return self.io(Err(e)),
            };
            if line.contains(END_SETUP_MARKER) {
                break;
            }
            lines.push(line);
        }

        let sensors = parse_setup_lines(lines.iter().map(String::as_str));
        log::info!("Bus setup found {} sensor(s)", sensors.len());
        Ok(sensors)
    }

    /// Trigger one read of `kind` and wait for its frame
    #[tracing::instrument(skip(self))]
    pub fn read_one(&self, kind: SensorKind, timeout: Duration) -> Result<Reading, SessionError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("read_one"), 0));

        self.ensure_connected()?;
        let settings = self.settings();
        let command = self.config.dialect.read_single(kind, &settings);

        let mut transport = lock(&self.transport);
        self.write_locked(&mut transport, &command)?;
        self.collect_reading(&mut transport, kind, &settings, timeout)
    }

    /// Wait for the next frame of a host that is streaming on its own
    pub fn next_reading(&self, kind: SensorKind, timeout: Duration) -> Result<Reading, SessionError> {
        self.ensure_connected()?;
        let settings = self.settings();
        let mut transport = lock(&self.transport);
        self.collect_reading(&mut transport, kind, &settings, timeout)
    }

    fn collect_reading(
        &self,
        transport: &mut T,
        kind: SensorKind,
        settings: &SensorSettings,
        timeout: Duration,
    ) -> Result<Reading, SessionError> {
        // Gain lines report cycles of the read tick, whatever tick the host was configured in
        let commanded_cycles = settings.integration_cycles(MS_PER_INTEGRATION_CYCLE);
        let mut assembler = ReadingAssembler::with_fallback(settings.gain, commanded_cycles);
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::DeviceTimeout { waited: timeout });
            }
            let line = match transport.read_line(remaining) {
                Ok(line) => line,
                Err(TransportError::Timeout { .. }) => {
                    log::warn!("{} did not finish a {} frame in {:?}", transport.describe(), kind, timeout);
                    return Err(SessionError::DeviceTimeout { waited: timeout });
                }
                Err(e) => return self.io(Err(e)),
            };

            match assembler.push_line(&line) {
                Step::Pending => {}
                Step::Complete(reading) if reading.sensor() == kind => return Ok(reading),
                Step::Complete(reading) => {
                    log::debug!("Dropping {} reading while waiting for {}", reading.sensor(), kind);
                }
                Step::Aborted(AbortReason::Incomplete { missing }) => {
                    return Err(SessionError::IncompleteFrame { sensor: kind, missing });
                }
                Step::Aborted(reason) => {
                    log::debug!("Frame aborted ({:?}), waiting for the next START READ", reason);
                }
            }
        }
    }

    /// Read once per integration time in `integration_ms`.
    ///
    /// Saturated readings are kept; the caller decides what to do with them. The
    /// integration time in effect before the sweep is restored on the host and the
    /// device afterwards, also when the sweep fails.
    #[tracing::instrument(skip(self))]
    pub fn read_range(&self, kind: SensorKind, integration_ms: &[f64]) -> Result<Vec<Reading>, SessionError> {
        let original = self.settings();
        let mut readings = Vec::with_capacity(integration_ms.len());

        let result = integration_ms.iter().try_for_each(|&ms| {
            self.set_integration_time(kind, ms)?;
            let reading = self.read_one(kind, self.config.read_timeout)?;
            if reading.saturated() {
                log::warn!("{} saturated at {} ms", kind, ms);
            }
            readings.push(reading);
            Ok::<_, SessionError>(())
        });

        let restored = if integration_ms.is_empty() {
            Ok(())
        } else {
            self.push_integration_time(kind, &original)
        };
        self.update_settings(original);
        match (result, restored) {
            (Err(e), Err(restore)) => {
                log::warn!("Could not restore {} integration time: {}", kind, restore);
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(readings),
        }
    }

    /// Take one reading and switch to the gain its peak count calls for
    #[tracing::instrument(skip(self))]
    pub fn auto_gain(&self, kind: SensorKind) -> Result<Gain, SessionError> {
        let reading = self.read_one(kind, self.config.read_timeout)?;
        let current = self.settings().gain;
        match Gain::auto_range(reading.max_raw()) {
            Some(gain) if gain != current => {
                log::info!("Peak {} counts, gain {} -> {}", reading.max_raw(), current, gain);
                self.set_gain(kind, gain)?;
                Ok(gain)
            }
            _ => Ok(current),
        }
    }

    /// Mark continuous mode as running with `period` between reads
    pub fn start_continuous(&self, period: Duration) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let current = self.settings();
        let settings = SensorSettings::builder()
            .gain(current.gain)
            .integration_time_ms(current.integration_time_ms)
            .leds(current.leds)
            .led_current(current.led_current)
            .led_on(current.led_on)
            .read_period(period)
            .build()?;
        self.update_settings(settings);
        self.continuous.store(true, Ordering::SeqCst);
        log::debug!("Continuous reads every {:?}", period);
        Ok(())
    }

    pub fn stop_continuous(&self) {
        if self.continuous.swap(false, Ordering::SeqCst) {
            log::debug!("Continuous reads stopped");
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    /// Period between continuous reads
    pub fn read_period(&self) -> Duration {
        lock(&self.settings).read_period
    }

    /// One step of continuous mode; `None` once continuous mode has been stopped
    pub fn continuous_cycle(&self, kind: SensorKind) -> Result<Option<Reading>, SessionError> {
        if !self.is_continuous() {
            return Ok(None);
        }
        self.read_one(kind, self.config.read_timeout).map(Some)
    }

    /// Let the host stream frames by itself at `period`; PSoC hosts only
    pub fn start_device_streaming(&self, kind: SensorKind, period: Duration) -> Result<(), SessionError> {
        let dialect = self.config.dialect;
        let set_period = dialect.set_read_period(period)?;
        let start = dialect.start_continuous(kind)?;
        self.start_continuous(period)?;
        let sent = self.send(set_period).and_then(|_| self.send(start));
        if sent.is_err() {
            self.stop_continuous();
        }
        sent
    }

    /// Stop listening to a streaming host and drop what it already sent.
    ///
    /// The firmware has no stop command, so this only ends continuous mode on this side.
    pub fn stop_device_streaming(&self) -> Result<(), SessionError> {
        self.stop_continuous();
        self.ensure_connected()?;
        let mut transport = lock(&self.transport);
        let leftover = self.io(transport.read_all_available())?;
        log::debug!("Discarded {} bytes after stopping the stream", leftover.len());
        Ok(())
    }
}
