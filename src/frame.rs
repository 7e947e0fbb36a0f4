//! Classification of the text lines a host controller emits.
//!
//! Every response line is ASCII terminated with `\r\n`. A read cycle looks like:
//!
//! ```text
//! AS7262 START READ
//! AS7262 RAW DATA: [100, 200, 300, 400, 500, 600]
//! integration cycles:50|x|16|
//! AS7262 CAL DATA: [10.5, 20.1, 30.0, 40.2, 50.9, 60.3]
//! AS7262 END READ
//! ```
//!
//! Anything that does not match a marker is [`LineKind::Unrecognized`]; the firmware
//! interleaves diagnostic prints with frame data.

use crate::sensor::SensorKind;
use crate::settings::Gain;

const START_READ_MARKER: &str = "START READ";
const END_READ_MARKER: &str = "END READ";
const RAW_DATA_MARKER: &str = "RAW DATA:";
const CAL_DATA_MARKER: &str = "CAL DATA:";
const CYCLES_MARKER: &str = "cycles:";

/// Signature the PSoC host answers to `ID`
pub const PSOC_SIGNATURE: &str = "PSoC-Spectrometer";

/// Replies accepted as identification lines
const IDENTIFICATION_REPLIES: [&str; 5] = [PSOC_SIGNATURE, "AS7262", "AS7263", "AS7265x", "AS7265X"];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame line '{line}': {reason}")]
    MalformedFrame { line: String, reason: String },
}

impl FrameError {
    fn malformed(line: &str, reason: impl Into<String>) -> Self {
        FrameError::MalformedFrame {
            line: line.to_string(),
            reason: reason.into(),
        }
    }
}

/// One classified response line
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    StartRead(SensorKind),
    /// Raw ADC counts; `sensor` is `None` when the line carries no tag
    RawData {
        sensor: Option<SensorKind>,
        values: Vec<f64>,
    },
    CalibratedData {
        sensor: Option<SensorKind>,
        values: Vec<f64>,
    },
    GainAndIntegration {
        gain: Gain,
        integration_cycles: u32,
    },
    IdentificationReply(String),
    EndRead(SensorKind),
    Unrecognized,
}

/// Strip line terminators, NUL padding from USB packets, and surrounding blanks.
pub fn clean_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Classify a single response line.
///
/// Fails with [`FrameError::MalformedFrame`] when a line carries a data marker but
/// its payload cannot be parsed.
pub fn classify(line: &[u8]) -> Result<LineKind, FrameError> {
    let text = clean_line(line);
    classify_str(&text)
}

pub fn classify_str(text: &str) -> Result<LineKind, FrameError> {
    if let Some(tag) = tag_before(text, RAW_DATA_MARKER) {
        let values = parse_numeric_list(text)?;
        return Ok(LineKind::RawData {
            sensor: tag.and_then(SensorKind::from_tag),
            values,
        });
    }

    if let Some(tag) = tag_before(text, CAL_DATA_MARKER) {
        let values = parse_numeric_list(text)?;
        return Ok(LineKind::CalibratedData {
            sensor: tag.and_then(SensorKind::from_tag),
            values,
        });
    }

    if text.to_ascii_lowercase().contains(CYCLES_MARKER) {
        let (gain, integration_cycles) = parse_gain_and_integration(text)?;
        return Ok(LineKind::GainAndIntegration {
            gain,
            integration_cycles,
        });
    }

    if let Some(kind) = tag_before(text, START_READ_MARKER).flatten().and_then(SensorKind::from_tag) {
        return Ok(LineKind::StartRead(kind));
    }

    if let Some(kind) = tag_before(text, END_READ_MARKER).flatten().and_then(SensorKind::from_tag) {
        return Ok(LineKind::EndRead(kind));
    }

    if IDENTIFICATION_REPLIES.contains(&text) {
        return Ok(LineKind::IdentificationReply(text.to_string()));
    }

    Ok(LineKind::Unrecognized)
}

/// If `marker` occurs in `text`, return the token in front of it (the sensor tag).
///
/// Outer `None`: no marker. Inner `None`: marker without a tag.
fn tag_before<'a>(text: &'a str, marker: &str) -> Option<Option<&'a str>> {
    let pos = text.find(marker)?;
    Some(text[..pos].split_whitespace().last())
}

/// Extract the bracketed, comma separated list following a data marker.
pub fn parse_numeric_list(text: &str) -> Result<Vec<f64>, FrameError> {
    let open = text
        .find('[')
        .ok_or_else(|| FrameError::malformed(text, "missing '['"))?;
    let close = text[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| FrameError::malformed(text, "missing ']'"))?;

    text[open + 1..close]
        .split(',')
        .map(|token| {
            let token = token.trim();
            token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| FrameError::malformed(text, format!("'{}' is not a number", token)))
        })
        .collect()
}

fn field_value(field: &str) -> &str {
    field.rsplit(':').next().unwrap_or(field).trim()
}

/// Parse `integration cycles:<n>|...|<gain>|...`.
///
/// Integration cycles live in the first pipe-delimited field and the gain in the
/// third, each optionally prefixed by a `label:`.
pub fn parse_gain_and_integration(text: &str) -> Result<(Gain, u32), FrameError> {
    let fields: Vec<&str> = text.split('|').collect();
    if fields.len() < 3 {
        return Err(FrameError::malformed(text, "expected at least 3 '|' separated fields"));
    }

    let cycles_str = field_value(fields[0]);
    let integration_cycles = cycles_str
        .parse::<f64>()
        .ok()
        .filter(|c| c.fract() == 0.0 && *c >= 1.0 && *c <= u32::MAX as f64)
        .map(|c| c as u32)
        .ok_or_else(|| {
            FrameError::malformed(text, format!("'{}' is not a positive cycle count", cycles_str))
        })?;

    let gain_str = field_value(fields[2]);
    let gain = gain_str
        .parse::<f64>()
        .ok()
        .and_then(|g| Gain::from_multiplier(g).ok())
        .ok_or_else(|| FrameError::malformed(text, format!("'{}' is not a sensor gain", gain_str)))?;

    Ok((gain, integration_cycles))
}

/// Length of the binary single-read packet the PSoC sends over USB
pub const FLOAT_PACKET_LEN: usize = 24;

/// Decode a single-read packet: six big-endian `f32` channel values.
pub fn decode_float_packet(packet: &[u8]) -> Result<[f32; 6], FrameError> {
    if packet.len() < FLOAT_PACKET_LEN {
        return Err(FrameError::malformed(
            &format!("{:02x?}", packet),
            format!("{} bytes, expected {}", packet.len(), FLOAT_PACKET_LEN),
        ));
    }

    let mut values = [0f32; 6];
    for (value, bytes) in values.iter_mut().zip(packet.chunks_exact(4)) {
        *value = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(values)
}
