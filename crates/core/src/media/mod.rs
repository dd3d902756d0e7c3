//! Media types and RTP packetization.
//!
//! This module provides the encoded-media data model ([`CodecConfig`],
//! [`EncodedSample`], [`StreamEvent`]) and the [`Packetizer`] trait with
//! its H.264 implementation.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection.
//! - **Timestamp** (32-bit): 90 kHz media clock derived from the frame index.
//! - **SSRC** (32-bit): randomly chosen per session.
//! - **Marker bit**: set on the last packet of an access unit.

pub mod h264;
pub mod rtp;
mod sample;

pub use sample::{CodecConfig, EncodedSample, StreamEvent, StreamFormat};

/// Codec-specific RTP packetizer, one instance per session.
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one access unit into complete RTP packets: 12-byte header
    /// (RFC 3550 §5.1) followed by the codec-specific payload.
    fn packetize_sample(&mut self, sample: &EncodedSample) -> Vec<Vec<u8>>;

    /// Record the parameter sets of a new configuration epoch.
    fn update_format(&mut self, format: &StreamFormat);

    /// Codec name for the SDP `a=rtpmap` attribute.
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number. Dynamic types use 96–127.
    fn payload_type(&self) -> u8;

    /// Synchronization source, fixed for the packetizer's lifetime.
    fn ssrc(&self) -> u32;

    /// Sequence number of the next packet (for the `RTP-Info` header).
    fn next_sequence(&self) -> u16;

    /// Current RTP timestamp (for the `RTP-Info` header).
    fn next_rtp_timestamp(&self) -> u32;
}
