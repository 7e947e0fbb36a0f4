//! Assembles classified lines into [`Reading`]s.
//!
//! ```text
//! Idle --StartRead--> Assembling --EndRead (complete)--> Idle, emits Reading
//!                         |------EndRead (missing data)--> Idle, IncompleteFrame
//!                         |------malformed line---------> Idle, Malformed
//!                         |------StartRead--------------> Assembling (previous discarded)
//! ```

use crate::frame::{classify, FrameError, LineKind};
use crate::reading::{check_saturation, normalize, Reading};
use crate::sensor::SensorKind;
use crate::settings::Gain;

/// Why an in-flight frame was discarded
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// A data line could not be parsed or had the wrong channel count
    Malformed(FrameError),
    /// `END READ` arrived before raw/calibrated data (or integration info) was known
    Incomplete { missing: &'static str },
    /// A new `START READ` arrived before `END READ`
    Superseded,
}

/// Result of feeding one line
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Nothing to report yet
    Pending,
    Complete(Reading),
    Aborted(AbortReason),
}

/// Accumulator bound to one in-flight frame
#[derive(Debug, Clone)]
struct ParserState {
    sensor: SensorKind,
    raw_data: Option<Vec<f64>>,
    calibrated_data: Option<Vec<f64>>,
    gain: Option<Gain>,
    integration_cycles: Option<u32>,
    saturated: bool,
    norm_data: Option<Vec<f64>>,
}

impl ParserState {
    fn new(sensor: SensorKind) -> Self {
        Self {
            sensor,
            raw_data: None,
            calibrated_data: None,
            gain: None,
            integration_cycles: None,
            saturated: false,
            norm_data: None,
        }
    }

    /// Compute normalized data as soon as both calibrated data and cycles are known
    fn try_normalize(&mut self) {
        if let (Some(cal), Some(cycles)) = (&self.calibrated_data, self.integration_cycles) {
            self.norm_data = Some(normalize(cal, cycles));
        }
    }

    fn check_length(&self, values: &[f64], line: &str) -> Result<(), FrameError> {
        let expected = self.sensor.channel_count();
        if values.len() != expected {
            return Err(FrameError::MalformedFrame {
                line: line.to_string(),
                reason: format!("{} values, {} expects {}", values.len(), self.sensor, expected),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    Assembling(ParserState),
}

/// Line-driven state machine that yields at most one [`Reading`] per frame
#[derive(Debug, Clone)]
pub struct ReadingAssembler {
    state: State,
    fallback: Option<(Gain, u32)>,
}

impl Default for ReadingAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingAssembler {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            fallback: None,
        }
    }

    /// Gain and cycles to assume when a frame omits its gain/integration line
    pub fn with_fallback(gain: Gain, integration_cycles: u32) -> Self {
        Self {
            state: State::Idle,
            fallback: Some((gain, integration_cycles.max(1))),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Sensor of the frame being assembled, if any
    pub fn in_flight(&self) -> Option<SensorKind> {
        match &self.state {
            State::Idle => None,
            State::Assembling(p) => Some(p.sensor),
        }
    }

    /// Drop any in-flight frame
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Classify and feed one raw response line
    pub fn push_line(&mut self, line: &[u8]) -> Step {
        match classify(line) {
            Ok(kind) => self.push(kind, line),
            Err(e) => self.abort_malformed(e),
        }
    }

    fn abort_malformed(&mut self, error: FrameError) -> Step {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Assembling(p) => {
                log::warn!("Discarding {} frame: {}", p.sensor, error);
                Step::Aborted(AbortReason::Malformed(error))
            }
            State::Idle => {
                log::debug!("Ignoring malformed line outside a frame: {}", error);
                Step::Pending
            }
        }
    }

    /// Feed one already classified line; `line` is only used for diagnostics
    pub fn push(&mut self, kind: LineKind, line: &[u8]) -> Step {
        let text = String::from_utf8_lossy(line);

        if let LineKind::StartRead(sensor) = kind {
            let previous = std::mem::replace(&mut self.state, State::Assembling(ParserState::new(sensor)));
            return match previous {
                State::Assembling(p) => {
                    log::warn!("{} START READ before {} END READ, dropping previous frame", sensor, p.sensor);
                    Step::Aborted(AbortReason::Superseded)
                }
                State::Idle => {
                    log::debug!("{} frame started", sensor);
                    Step::Pending
                }
            };
        }

        let State::Assembling(p) = &mut self.state else {
            if !matches!(kind, LineKind::Unrecognized) {
                log::debug!("Ignoring line outside a frame: {}", text.trim_end());
            }
            return Step::Pending;
        };

        match kind {
            LineKind::RawData { sensor, values } => {
                if sensor.is_some_and(|s| s != p.sensor) {
                    log::debug!("Ignoring raw data tagged for another sensor: {}", text.trim_end());
                    return Step::Pending;
                }
                if let Err(e) = p.check_length(&values, &text) {
                    return self.abort_malformed(e);
                }
                p.saturated = check_saturation(&values);
                if p.saturated {
                    log::warn!("{} raw data saturated", p.sensor);
                }
                p.raw_data = Some(values);
                Step::Pending
            }
            LineKind::CalibratedData { sensor, values } => {
                if sensor.is_some_and(|s| s != p.sensor) {
                    log::debug!("Ignoring calibrated data tagged for another sensor: {}", text.trim_end());
                    return Step::Pending;
                }
                if let Err(e) = p.check_length(&values, &text) {
                    return self.abort_malformed(e);
                }
                p.calibrated_data = Some(values);
                p.try_normalize();
                Step::Pending
            }
            LineKind::GainAndIntegration {
                gain,
                integration_cycles,
            } => {
                p.gain = Some(gain);
                p.integration_cycles = Some(integration_cycles);
                p.try_normalize();
                Step::Pending
            }
            LineKind::EndRead(sensor) if sensor == p.sensor => self.finish(),
            LineKind::EndRead(sensor) => {
                log::debug!("Ignoring {} END READ inside {} frame", sensor, p.sensor);
                Step::Pending
            }
            LineKind::IdentificationReply(_) | LineKind::Unrecognized => Step::Pending,
            LineKind::StartRead(_) => Step::Pending,
        }
    }

    fn finish(&mut self) -> Step {
        let State::Assembling(p) = std::mem::replace(&mut self.state, State::Idle) else {
            return Step::Pending;
        };

        let Some(raw_data) = p.raw_data else {
            return incomplete(p.sensor, "raw data");
        };
        let Some(calibrated_data) = p.calibrated_data else {
            return incomplete(p.sensor, "calibrated data");
        };
        let Some((gain, integration_cycles)) = p
            .gain
            .zip(p.integration_cycles)
            .or(self.fallback)
        else {
            return incomplete(p.sensor, "gain and integration cycles");
        };

        let norm_data = match p.norm_data {
            Some(norm) => norm,
            None => normalize(&calibrated_data, integration_cycles),
        };
        let reading = Reading::from_channel_order(
            p.sensor,
            raw_data,
            calibrated_data,
            norm_data,
            gain,
            integration_cycles,
            p.saturated,
        );
        log::debug!(
            "{} frame complete: gain {}, {} cycles, saturated: {}",
            p.sensor,
            gain,
            integration_cycles,
            reading.saturated()
        );
        Step::Complete(reading)
    }
}

fn incomplete(sensor: SensorKind, missing: &'static str) -> Step {
    log::warn!("{} END READ without {}", sensor, missing);
    Step::Aborted(AbortReason::Incomplete { missing })
}
