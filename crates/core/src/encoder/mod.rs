//! Encoder orchestration.
//!
//! The orchestrator depends only on the [`Encoder`] and [`EncoderFactory`]
//! capabilities, so a hardware codec, a software encoder, or a test double
//! can sit behind it:
//!
//! ```text
//! RawFrame ──convert──▶ Encoder::queue_input
//!                           │
//!            Encoder::drain_next ──▶ FormatChanged ──▶ CodecConfig (SPS/PPS)
//!                                └─▶ Data ──────────▶ EncodedSample
//! ```

pub mod convert;
mod frame;
mod orchestrator;
pub mod stub;

use std::time::Duration;

use crate::config::BitrateMode;
use crate::error::Result;

pub use frame::{Plane, RawFrame};
pub use orchestrator::{EncoderOrchestrator, EncoderSnapshot, EncoderStatus};

/// Raw input layouts an encoder may accept. All are YUV 4:2:0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Y plane, then interleaved U/V (NV12).
    SemiPlanar,
    /// Y plane, then U plane, then V plane (I420).
    Planar,
    /// Y plane, then interleaved V/U (NV21).
    InterleavedVu,
}

impl ColorFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SemiPlanar => "nv12",
            Self::Planar => "i420",
            Self::InterleavedVu => "nv21",
        }
    }
}

/// Pick the layout to convert frames into.
///
/// The encoder's declared preference wins; otherwise semi-planar, then
/// planar, then whatever the encoder lists first.
pub fn choose_color_format(
    preferred: Option<ColorFormat>,
    supported: &[ColorFormat],
) -> Option<ColorFormat> {
    preferred
        .or_else(|| {
            [ColorFormat::SemiPlanar, ColorFormat::Planar]
                .into_iter()
                .find(|f| supported.contains(f))
        })
        .or_else(|| supported.first().copied())
}

/// Everything an encoder instance is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub bitrate_mode: BitrateMode,
    pub fps: u32,
    pub keyframe_interval_secs: u32,
    pub color_format: ColorFormat,
}

/// One result of [`Encoder::drain_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    /// The output format is known. Carries the codec-specific configuration
    /// buffers; either may hold SPS, PPS, or both.
    FormatChanged { config_buffers: Vec<Vec<u8>> },
    /// One encoded access unit in Annex B form.
    Data {
        payload: Vec<u8>,
        key_frame: bool,
        pts_us: u64,
    },
}

/// A configured H.264 encoder instance.
pub trait Encoder: Send {
    /// Human-readable codec identity.
    fn name(&self) -> &str;

    /// Whether the codec runs on dedicated hardware.
    fn is_hardware(&self) -> bool;

    /// Explicitly preferred input layout, if the codec declares one.
    fn preferred_color_format(&self) -> Option<ColorFormat>;

    /// Every input layout the codec accepts.
    fn supported_color_formats(&self) -> &[ColorFormat];

    /// Configure and start the codec.
    fn configure(&mut self, settings: &EncoderSettings) -> Result<()>;

    /// Hand one converted frame to the codec. `Ok(false)` means no input
    /// buffer became free within `timeout`.
    fn queue_input(&mut self, frame: &[u8], pts_us: u64, timeout: Duration) -> Result<bool>;

    /// Next available output, or `None` when nothing is ready yet.
    fn drain_next(&mut self) -> Option<EncoderOutput>;

    /// Stop the codec and release its resources. Idempotent.
    fn stop(&mut self);
}

/// Creates fresh encoder instances; one per (re)configuration.
pub trait EncoderFactory: Send {
    fn create(&self) -> Result<Box<dyn Encoder>>;
}

/// External back-pressure signal applied as a bitrate / mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureState {
    #[default]
    Nominal,
    /// Shed some bitrate.
    Elevated,
    /// Shed most bitrate and force constant bitrate.
    Critical,
}

impl PressureState {
    /// Share of the target bitrate to keep, in percent.
    pub fn bitrate_percent(&self) -> u32 {
        match self {
            Self::Nominal => 100,
            Self::Elevated => 60,
            Self::Critical => 30,
        }
    }

    pub fn mode_override(&self) -> Option<BitrateMode> {
        match self {
            Self::Critical => Some(BitrateMode::Cbr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_preference_wins() {
        let chosen = choose_color_format(
            Some(ColorFormat::InterleavedVu),
            &[ColorFormat::SemiPlanar, ColorFormat::InterleavedVu],
        );
        assert_eq!(chosen, Some(ColorFormat::InterleavedVu));
    }

    #[test]
    fn semi_planar_then_planar_then_first() {
        use ColorFormat::*;
        assert_eq!(choose_color_format(None, &[Planar, SemiPlanar]), Some(SemiPlanar));
        assert_eq!(choose_color_format(None, &[InterleavedVu, Planar]), Some(Planar));
        assert_eq!(choose_color_format(None, &[InterleavedVu]), Some(InterleavedVu));
        assert_eq!(choose_color_format(None, &[]), None);
    }

    #[test]
    fn pressure_scales_down() {
        assert!(PressureState::Critical.bitrate_percent() < PressureState::Elevated.bitrate_percent());
        assert_eq!(PressureState::Nominal.mode_override(), None);
        assert_eq!(PressureState::Critical.mode_override(), Some(BitrateMode::Cbr));
    }
}
