// Frame -> normalized intensity
//
// Pure functions, no state and no I/O. Arithmetic happens in f64 so that
// |i16::MIN| does not overflow.

use crate::streaming::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Full scale of a signed 16-bit sample
pub const FULL_SCALE_16BIT: f32 = 32768.0;

/// Calibration ceiling that leaves headroom below full scale
pub const ALTERNATE_CEILING: f32 = 30000.0;

/// How a frame (or window of frames) is collapsed to one amplitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReductionMode {
    /// `(|left| + |right|) / 2`
    #[default]
    AbsAverage,
    /// `sqrt(mean(sample^2))` over every sample in the window
    Rms,
    /// `max(|left|, |right|)`
    MaxAbs,
}

impl ReductionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReductionMode::AbsAverage => "abs-average",
            ReductionMode::Rms => "rms",
            ReductionMode::MaxAbs => "max-abs",
        }
    }
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReductionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abs-average" | "abs_average" | "average" => Ok(ReductionMode::AbsAverage),
            "rms" => Ok(ReductionMode::Rms),
            "max-abs" | "max_abs" | "peak" => Ok(ReductionMode::MaxAbs),
            other => Err(format!(
                "unknown reduction mode '{}' (expected abs-average, rms or max-abs)",
                other
            )),
        }
    }
}

/// Raw (un-normalized) amplitude of a window of frames
pub fn amplitude(frames: &[Frame], mode: ReductionMode) -> f64 {
    if frames.is_empty() {
        return 0.0;
    }
    let abs = |s: i16| (s as f64).abs();

    match mode {
        ReductionMode::AbsAverage => {
            let sum: f64 = frames
                .iter()
                .map(|f| (abs(f.left) + abs(f.right)) / 2.0)
                .sum();
            sum / frames.len() as f64
        }
        ReductionMode::Rms => {
            let sum_sq: f64 = frames
                .iter()
                .map(|f| {
                    let (l, r) = (f.left as f64, f.right as f64);
                    l * l + r * r
                })
                .sum();
            (sum_sq / (frames.len() * 2) as f64).sqrt()
        }
        ReductionMode::MaxAbs => frames
            .iter()
            .map(|f| abs(f.left).max(abs(f.right)))
            .fold(0.0, f64::max),
    }
}

/// Normalize a window of frames into `[0.0, 1.0]`
///
/// An empty window is silence. A non-positive ceiling yields 0.0 rather than
/// dividing by zero; `PipelineConfig::validate` rejects such ceilings upfront.
pub fn reduce(frames: &[Frame], mode: ReductionMode, ceiling: f32) -> f32 {
    if frames.is_empty() || ceiling.is_nan() || ceiling <= 0.0 {
        return 0.0;
    }
    clamp_unit((amplitude(frames, mode) / ceiling as f64) as f32)
}

/// Clamp into `[0.0, 1.0]`, mapping NaN to 0.0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Convert a normalized value into the 0..=255 level written to serial
pub fn to_serial_level(value: f32) -> u8 {
    (clamp_unit(value) * 255.0).round() as u8
}

/// Reduction mode and ceiling bundled together
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntensityReducer {
    pub mode: ReductionMode,
    pub ceiling: f32,
}

impl Default for IntensityReducer {
    fn default() -> Self {
        Self {
            mode: ReductionMode::default(),
            ceiling: FULL_SCALE_16BIT,
        }
    }
}

impl IntensityReducer {
    pub fn new(mode: ReductionMode, ceiling: f32) -> Self {
        Self { mode, ceiling }
    }

    pub fn reduce_frame(&self, frame: Frame) -> f32 {
        reduce(std::slice::from_ref(&frame), self.mode, self.ceiling)
    }

    pub fn reduce_window(&self, frames: &[Frame]) -> f32 {
        reduce(frames, self.mode, self.ceiling)
    }
}
