use std::fmt;
use std::sync::OnceLock;

/// Wavelengths (nm) of the AS7262 visible channels, in channel order.
pub const AS7262_WAVELENGTHS: [u32; 6] = [450, 500, 550, 570, 600, 650];

/// Wavelengths (nm) of the AS7263 near-infrared channels, in channel order.
pub const AS7263_WAVELENGTHS: [u32; 6] = [610, 680, 730, 760, 810, 860];

/// Wavelengths (nm) of the AS7265x triad, in the order the firmware reports them.
///
/// The triad is three 6-channel dies (NIR, visible, UV) read back to back, so the
/// raw order is not monotonic.
pub const AS7265X_WAVELENGTHS: [u32; 18] = [
    610, 680, 730, 760, 810, 860, // AS72651
    560, 585, 645, 705, 900, 940, // AS72652
    410, 435, 460, 485, 510, 535, // AS72653
];

/// Physical sensor variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    As7262,
    As7263,
    As7265x,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::As7262, SensorKind::As7263, SensorKind::As7265x];

    /// Human readable name, as printed by the firmware during bus setup
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::As7262 => "AS7262",
            SensorKind::As7263 => "AS7263",
            SensorKind::As7265x => "AS7265x",
        }
    }

    /// Tag used in front of frame markers (`"<TAG> START READ"`) and in commands
    pub fn tag(&self) -> &'static str {
        match self {
            SensorKind::As7262 => "AS7262",
            SensorKind::As7263 => "AS7263",
            SensorKind::As7265x => "AS7265X",
        }
    }

    /// Lower-case object name used by the MicroPython host (`as7262.set_gain(..)`)
    pub fn object_name(&self) -> &'static str {
        match self {
            SensorKind::As7262 => "as7262",
            SensorKind::As7263 => "as7263",
            SensorKind::As7265x => "as7265x",
        }
    }

    /// Parse a frame tag; accepts both `AS7265X` and `AS7265x`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag().eq_ignore_ascii_case(tag.trim()))
    }

    /// Wavelengths in the order the firmware reports channels
    pub fn wavelengths(&self) -> &'static [u32] {
        match self {
            SensorKind::As7262 => &AS7262_WAVELENGTHS,
            SensorKind::As7263 => &AS7263_WAVELENGTHS,
            SensorKind::As7265x => &AS7265X_WAVELENGTHS,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.wavelengths().len()
    }

    /// Permutation that presents channels in ascending wavelength order.
    ///
    /// `None` when the raw channel order is already ascending.
    pub fn sort_index(&self) -> Option<&'static [usize]> {
        static AS7265X_SORT_INDEX: OnceLock<Vec<usize>> = OnceLock::new();
        match self {
            SensorKind::As7262 | SensorKind::As7263 => None,
            SensorKind::As7265x => Some(
                AS7265X_SORT_INDEX
                    .get_or_init(|| argsort(&AS7265X_WAVELENGTHS))
                    .as_slice(),
            ),
        }
    }

    /// Whether the host can drive separate illumination LEDs for this sensor
    pub fn has_led_bank(&self) -> bool {
        matches!(self, SensorKind::As7265x)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn argsort(values: &[u32]) -> Vec<usize> {
    let mut index: Vec<usize> = (0..values.len()).collect();
    index.sort_by_key(|&i| values[i]);
    index
}

/// Reorder `data` by `index`: output position `i` takes `data[index[i]]`.
pub fn permute<T: Copy>(data: &[T], index: &[usize]) -> Vec<T> {
    index.iter().map(|&i| data[i]).collect()
}

/// A sensor attached to the host, as learned from a handshake or bus setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub kind: SensorKind,
    pub has_button: bool,
    /// Port index on a multi-sensor bus, if the host reports one
    pub port: Option<u8>,
}

impl SensorDescriptor {
    pub fn new(kind: SensorKind, has_button: bool, port: Option<u8>) -> Self {
        Self {
            kind,
            has_button,
            port,
        }
    }

    pub fn wavelengths(&self) -> &'static [u32] {
        self.kind.wavelengths()
    }

    /// Wavelengths in the order readings are presented
    pub fn sorted_wavelengths(&self) -> Vec<u32> {
        match self.kind.sort_index() {
            Some(index) => permute(self.kind.wavelengths(), index),
            None => self.kind.wavelengths().to_vec(),
        }
    }
}

impl fmt::Display for SensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let button = if self.has_button {
            "with a button"
        } else {
            "without a button"
        };
        write!(f, "{} color sensor {}", self.kind.name(), button)
    }
}

/// Parse the reply to the `Setup` command of a multi-sensor bus host.
///
/// Each sensor is announced on its own line, e.g.
/// `"AS7265x device attached to port:2|No button attached"`.
pub fn parse_setup_lines<'a, I>(lines: I) -> Vec<SensorDescriptor>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sensors = Vec::new();
    for line in lines {
        let kind = SensorKind::ALL
            .into_iter()
            .find(|kind| line.contains(&format!("{} device attached", kind.name())));
        let Some(kind) = kind else {
            continue;
        };

        let has_button = !line.contains("No button attached");
        let port = line
            .split_once("to port:")
            .and_then(|(_, rest)| rest.split('|').next())
            .and_then(|p| p.trim().parse::<u8>().ok());

        log::debug!("Bus setup: {} on port {:?}, button: {}", kind, port, has_button);
        sensors.push(SensorDescriptor::new(kind, has_button, port));
    }
    sensors
}
