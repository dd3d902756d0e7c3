use std::sync::Arc;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::h264;

/// H.264 decoder configuration captured from the encoder's format-changed
/// event.
///
/// Both parameter sets are stored without start codes. Immutable once
/// captured; a resolution change produces a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    /// Sequence parameter set NAL (type 7), header byte included.
    pub sps: Vec<u8>,
    /// Picture parameter set NAL (type 8), if the encoder produced one.
    pub pps: Option<Vec<u8>>,
}

impl CodecConfig {
    /// Scan every configuration buffer for SPS and PPS NAL units.
    ///
    /// Encoders differ in how they split parameter sets across their
    /// configuration buffers (SPS in the first and PPS in the second, or
    /// both in one), so all of them are searched. The first SPS and first
    /// PPS found win. Returns `None` when no SPS is present.
    pub fn from_config_buffers<B: AsRef<[u8]>>(buffers: &[B]) -> Option<Self> {
        let mut sps = None;
        let mut pps = None;
        for buffer in buffers {
            for nal in h264::extract_nal_units(buffer.as_ref()) {
                match h264::nal_type(nal) {
                    Some(h264::NAL_SPS) if sps.is_none() => sps = Some(nal.to_vec()),
                    Some(h264::NAL_PPS) if pps.is_none() => pps = Some(nal.to_vec()),
                    _ => {}
                }
            }
        }
        sps.map(|sps| CodecConfig { sps, pps })
    }

    /// `profile_idc`, `constraint_set` flags and `level_idc`: the three
    /// bytes after the SPS NAL header.
    pub fn profile_bytes(&self) -> [u8; 3] {
        let byte = |i: usize| self.sps.get(i).copied().unwrap_or(0);
        [byte(1), byte(2), byte(3)]
    }

    /// `profile-level-id` fmtp parameter (RFC 6184 §8.1), hex encoded.
    pub fn profile_level_id(&self) -> String {
        let [profile, compat, level] = self.profile_bytes();
        format!("{profile:02x}{compat:02x}{level:02x}")
    }

    /// `sprop-parameter-sets` fmtp parameter: base64 SPS, then base64 PPS.
    pub fn sprop_parameter_sets(&self) -> String {
        match &self.pps {
            Some(pps) => format!(
                "{},{}",
                BASE64_STANDARD.encode(&self.sps),
                BASE64_STANDARD.encode(pps)
            ),
            None => BASE64_STANDARD.encode(&self.sps),
        }
    }
}

/// The codec configuration plus the geometry and timing it was produced
/// for. One per encoder configuration epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub config: CodecConfig,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Incremented every time the encoder is (re)created.
    pub epoch: u32,
}

/// One encoded access unit.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Annex-B payload (start-code delimited NAL units).
    pub data: Vec<u8>,
    pub key_frame: bool,
    /// Presentation time in microseconds.
    pub pts_us: u64,
    /// Index of the source frame in the orchestrator's frame counter.
    pub frame_index: u64,
    /// Presentation time on the 90 kHz RTP clock.
    pub clock_90k: u64,
    /// Configuration epoch the sample was encoded under.
    pub epoch: u32,
}

impl EncodedSample {
    /// NAL units of this sample, start codes stripped.
    pub fn nal_units(&self) -> Vec<&[u8]> {
        h264::extract_nal_units(&self.data)
    }

    /// Whether the sample carries its own SPS and PPS in-band.
    pub fn has_parameter_sets(&self) -> bool {
        let nals = self.nal_units();
        let has = |t| nals.iter().any(|n| h264::nal_type(n) == Some(t));
        has(h264::NAL_SPS) && has(h264::NAL_PPS)
    }
}

/// Message published by the encode loop to every stream subscriber.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A new codec configuration epoch began.
    Format(Arc<StreamFormat>),
    /// An encoded access unit, in submission order.
    Sample(Arc<EncodedSample>),
}
