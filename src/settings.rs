use std::fmt;
use std::time::Duration;

use crate::sensor::SensorKind;

/// Largest integration cycle count the sensors accept (8-bit register)
pub const MAX_INTEGRATION_CYCLES: u32 = 255;

/// Integration times (ms) swept by a default range read
pub const DEFAULT_RANGE_MS: [f64; 10] = [5.0, 10.0, 20.0, 40.0, 60.0, 80.0, 120.0, 160.0, 200.0, 250.0];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SettingsError {
    #[error("Integration time {ms} ms is out of range (1 to {max} cycles of {tick_ms} ms)")]
    IntegrationOutOfRange { ms: f64, tick_ms: f64, max: u32 },

    #[error("Read period too short (min {min_ms} ms)")]
    ReadPeriodTooShort { min_ms: u64 },

    #[error("LP55231 channel {0} out of range (0 to 17)")]
    LedChannelOutOfRange(u8),

    #[error("Unknown gain {0}, expected 1, 3.7, 16 or 64")]
    UnknownGain(f64),

    #[error("{dialect:?} hosts have no {command} command")]
    Unsupported { dialect: Dialect, command: &'static str },
}

/// A command ready to be written to the host controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Sensor amplifier gain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gain {
    X1,
    X3_7,
    X16,
    X64,
}

impl Gain {
    pub const ALL: [Gain; 4] = [Gain::X1, Gain::X3_7, Gain::X16, Gain::X64];

    pub fn multiplier(&self) -> f64 {
        match self {
            Gain::X1 => 1.0,
            Gain::X3_7 => 3.7,
            Gain::X16 => 16.0,
            Gain::X64 => 64.0,
        }
    }

    /// Register code written to the sensor
    pub fn code(&self) -> u8 {
        match self {
            Gain::X1 => 0,
            Gain::X3_7 => 1,
            Gain::X16 => 2,
            Gain::X64 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.code() == code)
    }

    pub fn from_multiplier(value: f64) -> Result<Self, SettingsError> {
        Self::ALL
            .into_iter()
            .find(|g| (g.multiplier() - value).abs() < 1e-6)
            .ok_or(SettingsError::UnknownGain(value))
    }

    /// Pick the highest gain that keeps a signal of `max_raw` counts below 10000.
    ///
    /// Returns `None` when the signal is already too strong for any gain above 1x.
    pub fn auto_range(max_raw: f64) -> Option<Self> {
        [Gain::X64, Gain::X16, Gain::X3_7]
            .into_iter()
            .find(|g| max_raw < 10_000.0 / g.multiplier())
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.multiplier())
    }
}

/// Drive current of the sensor's illumination LED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCurrent {
    Ma12_5,
    Ma25,
    Ma50,
    Ma100,
}

impl LedCurrent {
    pub fn code(&self) -> u8 {
        match self {
            LedCurrent::Ma12_5 => 0,
            LedCurrent::Ma25 => 1,
            LedCurrent::Ma50 => 2,
            LedCurrent::Ma100 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedCurrent::Ma12_5 => "12.5 mA",
            LedCurrent::Ma25 => "25 mA",
            LedCurrent::Ma50 => "50 mA",
            LedCurrent::Ma100 => "100 mA",
        }
    }
}

/// LEDs mounted on the AS7265x triad board
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OnboardLed {
    White,
    Ir,
    Uv,
}

impl OnboardLed {
    pub fn index(&self) -> u8 {
        match self {
            OnboardLed::White => 0,
            OnboardLed::Ir => 1,
            OnboardLed::Uv => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OnboardLed::White => "White LED",
            OnboardLed::Ir => "IR LED",
            OnboardLed::Uv => "UV (405 nm) LED",
        }
    }
}

/// Which light sources to switch on for a read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedSelection {
    onboard: Vec<OnboardLed>,
    lp55231: Vec<u8>,
}

impl LedSelection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn onboard(mut self, led: OnboardLed) -> Self {
        if !self.onboard.contains(&led) {
            self.onboard.push(led);
            self.onboard.sort();
        }
        self
    }

    /// Add an LP55231 driver channel; channels 0-8 sit on the left driver, 9-17 on the right.
    pub fn lp55231_channel(mut self, channel: u8) -> Result<Self, SettingsError> {
        if channel > 17 {
            return Err(SettingsError::LedChannelOutOfRange(channel));
        }
        if !self.lp55231.contains(&channel) {
            self.lp55231.push(channel);
            self.lp55231.sort_unstable();
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.onboard.is_empty() && self.lp55231.is_empty()
    }

    pub fn onboard_leds(&self) -> &[OnboardLed] {
        &self.onboard
    }

    pub fn lp55231_channels(&self) -> &[u8] {
        &self.lp55231
    }

    /// Label describing the light sources, for collaborators that record it
    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "None".to_string();
        }
        let mut parts: Vec<String> = self.onboard.iter().map(|l| l.as_str().to_string()).collect();
        parts.extend(self.lp55231.iter().map(|c| format!("LP55231 channel {}", c)));
        parts.join(" + ")
    }
}

fn list_literal<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    let inner: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    format!("[{}]", inner.join(", "))
}

/// Settings owned by the UI layer and consumed by a session
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub gain: Gain,
    pub integration_time_ms: f64,
    pub leds: LedSelection,
    pub led_current: LedCurrent,
    pub led_on: bool,
    pub read_period: Duration,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            gain: Gain::X1,
            integration_time_ms: 140.0,
            leds: LedSelection::none(),
            led_current: LedCurrent::Ma12_5,
            led_on: false,
            read_period: Duration::from_secs(1),
        }
    }
}

impl SensorSettings {
    pub fn builder() -> SensorSettingsBuilder {
        SensorSettingsBuilder::new()
    }

    /// Integration time expressed in firmware cycles for the given tick length
    pub fn integration_cycles(&self, tick_ms: f64) -> u32 {
        ((self.integration_time_ms / tick_ms) as u32).clamp(1, MAX_INTEGRATION_CYCLES)
    }
}

#[derive(Debug)]
pub struct SensorSettingsBuilder {
    settings: SensorSettings,
}

impl SensorSettingsBuilder {
    const MIN_READ_PERIOD: Duration = Duration::from_millis(200);

    pub fn new() -> Self {
        Self {
            settings: SensorSettings::default(),
        }
    }

    pub fn gain(mut self, gain: Gain) -> Self {
        self.settings.gain = gain;
        self
    }

    pub fn integration_time_ms(mut self, ms: f64) -> Self {
        self.settings.integration_time_ms = ms;
        self
    }

    pub fn leds(mut self, leds: LedSelection) -> Self {
        self.settings.leds = leds;
        self
    }

    pub fn led_current(mut self, current: LedCurrent) -> Self {
        self.settings.led_current = current;
        self
    }

    pub fn led_on(mut self, on: bool) -> Self {
        self.settings.led_on = on;
        self
    }

    pub fn read_period(mut self, period: Duration) -> Self {
        self.settings.read_period = period;
        self
    }

    pub fn build(self) -> Result<SensorSettings, SettingsError> {
        let ms = self.settings.integration_time_ms;
        let tick_ms = Dialect::MicroPython.integration_tick_ms();
        let cycles = ms / tick_ms;
        if !ms.is_finite() || cycles < 1.0 || cycles >= (MAX_INTEGRATION_CYCLES + 1) as f64 {
            return Err(SettingsError::IntegrationOutOfRange {
                ms,
                tick_ms,
                max: MAX_INTEGRATION_CYCLES,
            });
        }
        if self.settings.read_period < Self::MIN_READ_PERIOD {
            return Err(SettingsError::ReadPeriodTooShort {
                min_ms: Self::MIN_READ_PERIOD.as_millis() as u64,
            });
        }
        Ok(self.settings)
    }
}

impl Default for SensorSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Command grammar spoken by the host controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PSoC firmware: `AS7262|GAIN|2`
    Psoc,
    /// WiPy / Arduino MicroPython REPL: `as7262.set_gain(2)`
    MicroPython,
}

impl Dialect {
    /// Length of one integration cycle in milliseconds
    pub fn integration_tick_ms(&self) -> f64 {
        match self {
            Dialect::Psoc => 5.6,
            Dialect::MicroPython => 2.8,
        }
    }

    pub fn identify(&self) -> Command {
        Command::new("ID")
    }

    pub fn identify_sensor(&self) -> Command {
        Command::new("ID-Spectrometer")
    }

    pub fn bus_setup(&self) -> Command {
        Command::new("Setup")
    }

    pub fn set_gain(&self, kind: SensorKind, gain: Gain) -> Command {
        match self {
            Dialect::Psoc => Command::new(format!("{}|GAIN|{}", kind.tag(), gain.code())),
            Dialect::MicroPython => {
                Command::new(format!("{}.set_gain({})", kind.object_name(), gain.code()))
            }
        }
    }

    fn unsupported(&self, command: &'static str) -> SettingsError {
        SettingsError::Unsupported {
            dialect: *self,
            command,
        }
    }

    /// PSoC only; MicroPython reads carry their integration time
    pub fn set_integration_time(
        &self,
        kind: SensorKind,
        settings: &SensorSettings,
    ) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => {
                let cycles = settings.integration_cycles(self.integration_tick_ms());
                Ok(Command::new(format!("{}|INTEGRATE_TIME|{:03}", kind.tag(), cycles)))
            }
            Dialect::MicroPython => Err(self.unsupported("integration time")),
        }
    }

    pub fn set_read_period(&self, period: Duration) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Ok(Command::new(format!(
                "SET_CONT_READ_PERIOD|{:05}",
                period.as_millis()
            ))),
            Dialect::MicroPython => Err(self.unsupported("read period")),
        }
    }

    /// Start host-side streaming. Neither firmware has a stop command.
    pub fn start_continuous(&self, kind: SensorKind) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Ok(Command::new(format!("{}|START", kind.tag()))),
            Dialect::MicroPython => Err(self.unsupported("start")),
        }
    }

    /// Single read, parameterized by integration time and, on the triad, the LEDs to light
    pub fn read_single(&self, kind: SensorKind, settings: &SensorSettings) -> Command {
        match self {
            Dialect::Psoc => Command::new(format!("{}|READ_SINGLE", kind.tag())),
            Dialect::MicroPython => {
                let cycles = settings.integration_cycles(self.integration_tick_ms());
                if kind.has_led_bank() {
                    Command::new(format!(
                        "{}_Read({}, {}, {})",
                        kind.tag(),
                        cycles,
                        list_literal(settings.leds.lp55231_channels()),
                        list_literal(settings.leds.onboard_leds().iter().map(|l| l.index()))
                    ))
                } else {
                    Command::new(format!("{}_Read({})", kind.tag(), cycles))
                }
            }
        }
    }

    /// Create the sensor and LED driver objects on the REPL; only MicroPython hosts need it
    pub fn init_objects(&self) -> Option<Command> {
        match self {
            Dialect::Psoc => None,
            Dialect::MicroPython => Some(Command::new("as7265x, lp55231_1, lp55231_2 = init()")),
        }
    }

    pub fn led_power(&self, kind: SensorKind, on: bool) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Ok(Command::new(format!(
                "{}|LED_CTRL|{}",
                kind.tag(),
                if on { "ON" } else { "OFF" }
            ))),
            Dialect::MicroPython => Err(self.unsupported("LED power")),
        }
    }

    pub fn led_current(&self, kind: SensorKind, current: LedCurrent) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Ok(Command::new(format!(
                "{}|POWER_LEVEL|{}",
                kind.tag(),
                current.code()
            ))),
            Dialect::MicroPython => Err(self.unsupported("LED current")),
        }
    }

    pub fn indicator(&self, kind: SensorKind, on: bool) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Err(self.unsupported("indicator")),
            Dialect::MicroPython => Ok(Command::new(format!(
                "{}.{}_indicator_led()",
                kind.object_name(),
                if on { "enable" } else { "disable" }
            ))),
        }
    }

    /// Switch a single onboard triad LED
    pub fn onboard_led(&self, led: OnboardLed, on: bool) -> Result<Command, SettingsError> {
        match self {
            Dialect::Psoc => Err(self.unsupported("onboard LED")),
            Dialect::MicroPython => Ok(Command::new(format!(
                "{}.{}_led({})",
                SensorKind::As7265x.object_name(),
                if on { "enable" } else { "disable" },
                led.index()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_codes() {
        for gain in Gain::ALL {
            assert_eq!(Gain::from_code(gain.code()), Some(gain));
        }
        assert_eq!(Gain::from_multiplier(3.7), Ok(Gain::X3_7));
        assert_eq!(Gain::from_multiplier(2.0), Err(SettingsError::UnknownGain(2.0)));
    }

    #[test]
    fn test_gain_auto_range() {
        assert_eq!(Gain::auto_range(100.0), Some(Gain::X64));
        assert_eq!(Gain::auto_range(200.0), Some(Gain::X16));
        assert_eq!(Gain::auto_range(2000.0), Some(Gain::X3_7));
        assert_eq!(Gain::auto_range(5000.0), None);
    }

    #[test]
    fn test_settings_builder_validation() {
        let settings = SensorSettings::builder()
            .gain(Gain::X16)
            .integration_time_ms(280.0)
            .build()
            .unwrap();
        assert_eq!(settings.integration_cycles(2.8), 100);
        assert_eq!(settings.integration_cycles(5.6), 50);

        assert!(matches!(
            SensorSettings::builder().integration_time_ms(1.0).build(),
            Err(SettingsError::IntegrationOutOfRange { .. })
        ));
        assert!(matches!(
            SensorSettings::builder().read_period(Duration::from_millis(50)).build(),
            Err(SettingsError::ReadPeriodTooShort { .. })
        ));
    }

    #[test]
    fn test_led_selection() {
        let leds = LedSelection::none()
            .onboard(OnboardLed::Uv)
            .onboard(OnboardLed::White)
            .lp55231_channel(9)
            .unwrap();
        assert_eq!(leds.onboard_leds(), &[OnboardLed::White, OnboardLed::Uv]);
        assert_eq!(leds.describe(), "White LED + UV (405 nm) LED + LP55231 channel 9");
        assert!(LedSelection::none().lp55231_channel(18).is_err());
        assert_eq!(LedSelection::none().describe(), "None");
    }

    #[test]
    fn test_psoc_commands() {
        let settings = SensorSettings::builder().integration_time_ms(280.0).build().unwrap();
        let d = Dialect::Psoc;
        assert_eq!(d.set_gain(SensorKind::As7262, Gain::X16).as_str(), "AS7262|GAIN|2");
        assert_eq!(
            d.set_integration_time(SensorKind::As7262, &settings).unwrap().as_str(),
            "AS7262|INTEGRATE_TIME|050"
        );
        assert_eq!(
            d.set_read_period(Duration::from_millis(1000)).unwrap().as_str(),
            "SET_CONT_READ_PERIOD|01000"
        );
        assert_eq!(d.start_continuous(SensorKind::As7262).unwrap().as_str(), "AS7262|START");
        assert_eq!(d.read_single(SensorKind::As7262, &settings).as_str(), "AS7262|READ_SINGLE");
        assert_eq!(d.led_power(SensorKind::As7262, true).unwrap().as_str(), "AS7262|LED_CTRL|ON");
        assert_eq!(
            d.led_current(SensorKind::As7262, LedCurrent::Ma50).unwrap().as_str(),
            "AS7262|POWER_LEVEL|2"
        );
        assert_eq!(d.init_objects(), None);
    }

    #[test]
    fn test_commands_missing_from_firmware_are_rejected() {
        let settings = SensorSettings::default();
        assert_eq!(
            Dialect::Psoc.indicator(SensorKind::As7262, true),
            Err(SettingsError::Unsupported {
                dialect: Dialect::Psoc,
                command: "indicator",
            })
        );
        assert!(Dialect::Psoc.onboard_led(OnboardLed::Uv, true).is_err());

        let mp = Dialect::MicroPython;
        assert!(mp.set_integration_time(SensorKind::As7262, &settings).is_err());
        assert!(mp.set_read_period(Duration::from_secs(1)).is_err());
        assert!(mp.start_continuous(SensorKind::As7262).is_err());
        assert!(mp.led_power(SensorKind::As7262, true).is_err());
        assert!(mp.led_current(SensorKind::As7262, LedCurrent::Ma12_5).is_err());
    }

    #[test]
    fn test_micropython_read_commands() {
        let leds = LedSelection::none()
            .onboard(OnboardLed::White)
            .lp55231_channel(3)
            .unwrap()
            .lp55231_channel(12)
            .unwrap();
        let settings = SensorSettings::builder()
            .integration_time_ms(28.0)
            .leds(leds)
            .build()
            .unwrap();
        let d = Dialect::MicroPython;
        assert_eq!(
            d.read_single(SensorKind::As7265x, &settings).as_str(),
            "AS7265X_Read(10, [3, 12], [0])"
        );
        assert_eq!(d.read_single(SensorKind::As7262, &settings).as_str(), "AS7262_Read(10)");
        assert_eq!(d.set_gain(SensorKind::As7262, Gain::X64).as_str(), "as7262.set_gain(3)");
        assert_eq!(
            d.indicator(SensorKind::As7262, true).unwrap().as_str(),
            "as7262.enable_indicator_led()"
        );
        assert_eq!(d.onboard_led(OnboardLed::Ir, false).unwrap().as_str(), "as7265x.disable_led(1)");
        assert_eq!(
            d.init_objects().map(Command::into_string).as_deref(),
            Some("as7265x, lp55231_1, lp55231_2 = init()")
        );
    }
}
