//! Stream-wide configuration.
//!
//! [`StreamConfig`] is immutable once handed to the encoder orchestrator;
//! runtime changes travel as [`ControlCommand`](crate::pipeline::ControlCommand)
//! messages and land in the orchestrator's own runtime state.

use std::time::Duration;

/// Dynamic RTP payload type advertised in SDP and written into every packet.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// RTP payload budget per packet. Keeps IP + UDP + RTP headers under a
/// 1500-byte path MTU.
pub const DEFAULT_RTP_PAYLOAD_BUDGET: usize = 1400;

/// How the encoder spends its bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateMode {
    /// Constant bitrate.
    Cbr,
    /// Variable bitrate.
    #[default]
    Vbr,
    /// Constant quality; bitrate is advisory.
    Cq,
}

impl std::str::FromStr for BitrateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cbr" => Ok(Self::Cbr),
            "vbr" => Ok(Self::Vbr),
            "cq" => Ok(Self::Cq),
            other => Err(format!("unknown bitrate mode: {other}")),
        }
    }
}

/// Immutable encoding parameters for a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Nominal capture width; the first frame's real size wins.
    pub width: u32,
    /// Nominal capture height.
    pub height: u32,
    /// Nominal frame rate. Drives presentation timestamps and RTP clock.
    pub fps: u32,
    /// Explicit bitrate in bits/s. `None` derives one from the resolution.
    pub bitrate: Option<u32>,
    pub bitrate_mode: BitrateMode,
    /// Seconds between forced keyframes.
    pub keyframe_interval_secs: u32,
    /// RTP payload type (96–127).
    pub payload_type: u8,
    /// Maximum RTP payload size before FU-A fragmentation.
    pub rtp_payload_budget: usize,
    /// How long `submit_frame` waits for a free encoder input buffer.
    pub input_timeout: Duration,
    /// Upper bound on encoder outputs pulled per `drain` call.
    pub max_drain_iterations: usize,
    /// Minimum delay between encoder creation attempts after a failure.
    pub reconfigure_cooldown: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate: None,
            bitrate_mode: BitrateMode::default(),
            keyframe_interval_secs: 1,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            rtp_payload_budget: DEFAULT_RTP_PAYLOAD_BUDGET,
            input_timeout: Duration::from_millis(10),
            max_drain_iterations: 32,
            reconfigure_cooldown: Duration::from_secs(1),
        }
    }
}

impl StreamConfig {
    /// Bitrate for the given resolution: the explicit override when set,
    /// otherwise [`default_bitrate`].
    pub fn bitrate_for(&self, width: u32, height: u32) -> u32 {
        self.bitrate.unwrap_or_else(|| default_bitrate(width, height))
    }
}

/// Resolution-appropriate default bitrate in bits/s.
///
/// Monotonic in pixel count: 1 Mbps up to 480p, 12 Mbps at 4K.
pub fn default_bitrate(width: u32, height: u32) -> u32 {
    let pixels = width as u64 * height as u64;
    match pixels {
        p if p <= 640 * 480 => 1_000_000,
        p if p <= 1280 * 720 => 2_500_000,
        p if p <= 1920 * 1080 => 5_000_000,
        p if p <= 2560 * 1440 => 8_000_000,
        _ => 12_000_000,
    }
}
