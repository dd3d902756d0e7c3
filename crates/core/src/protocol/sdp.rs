//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                             ← session name
//! c=IN IP4 0.0.0.0                             ← connection address
//! t=0 0                                        ← timing (live stream)
//! a=tool:streamcore                            ← server software (§6)
//! a=sendonly                                   ← direction (§6)
//! m=video 0 RTP/AVP 96                         ← media description
//! a=rtpmap:96 H264/90000                       ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...           ← codec parameters
//! a=control:track1                             ← track control URL
//! ```
//!
//! The connection address is the unspecified address: the stream is unicast
//! and its destination is negotiated by SETUP, not announced here.

use crate::media::CodecConfig;
use crate::media::h264;
use crate::server::ServerConfig;

/// Generate the session description for the live H.264 stream.
///
/// `host` only appears in the origin line. Without a codec configuration
/// the fmtp line carries just the packetization mode.
pub fn generate_sdp(
    codec: Option<&CodecConfig>,
    payload_type: u8,
    host: &str,
    config: &ServerConfig,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        config.sdp_username, config.sdp_session_id, config.sdp_session_version, host
    ));
    sdp.push(format!("s={}", config.sdp_session_name));
    sdp.push("c=IN IP4 0.0.0.0".to_string());
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:streamcore".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("m=video 0 RTP/AVP {}", payload_type));
    sdp.extend(h264::sdp_attributes(payload_type, codec));

    tracing::trace!(sdp = %sdp.join(" | "), "generated SDP");

    format!("{}\r\n", sdp.join("\r\n"))
}
