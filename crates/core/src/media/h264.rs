use super::rtp::{RTP_HEADER_LEN, RtpHeader, VIDEO_CLOCK_RATE};
use super::{CodecConfig, EncodedSample, Packetizer, StreamFormat};
use crate::config::DEFAULT_RTP_PAYLOAD_BUDGET;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
/// Fragmentation unit type A (RFC 6184 §5.8).
pub const NAL_FU_A: u8 = 28;

/// Largest payload whose RTP packet still fits an interleaved frame.
pub const MAX_PAYLOAD_BUDGET: usize = u16::MAX as usize - RTP_HEADER_LEN;

/// NAL unit type from the header byte, if the unit is non-empty.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL so boundaries between
/// adjacent NALs are computed correctly when mixed 3-byte and 4-byte
/// start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nal_units = Vec::with_capacity(start_entries.len());
    for (idx, &(start, _)) in start_entries.iter().enumerate() {
        let end = match start_entries.get(idx + 1) {
            Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
            None => data.len(),
        };

        if start < end {
            nal_units.push(&data[start..end]);
        }
    }

    nal_units
}

/// Convert an Annex B access unit to AVCC: every NAL unit is prefixed by
/// its 4-byte big-endian length instead of a start code.
pub fn annexb_to_avcc(data: &[u8]) -> Vec<u8> {
    let nals = extract_nal_units(data);
    let mut out = Vec::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Convert an AVCC access unit (4-byte lengths) back to Annex B with
/// 4-byte start codes. Returns `None` if a length runs past the buffer.
pub fn avcc_to_annexb(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;
    while !rest.is_empty() {
        let (len_bytes, tail) = rest.split_at_checked(4)?;
        let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
        let (nal, tail) = tail.split_at_checked(len)?;
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nal);
        rest = tail;
    }
    Some(out)
}

/// SDP media attributes for an H.264 stream (RFC 6184 §8.2.1).
///
/// Order matters: `a=rtpmap` defines the payload type and must precede
/// `a=fmtp` which references it.
pub fn sdp_attributes(pt: u8, config: Option<&CodecConfig>) -> Vec<String> {
    let mut fmtp = format!("a=fmtp:{pt} packetization-mode=1");
    if let Some(config) = config {
        fmtp.push_str(&format!(
            ";profile-level-id={};sprop-parameter-sets={}",
            config.profile_level_id(),
            config.sprop_parameter_sets()
        ));
    }

    vec![
        format!("a=rtpmap:{pt} H264/{VIDEO_CLOCK_RATE}"),
        fmtp,
        "a=control:track1".to_string(),
    ]
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Stateful per session: owns the session's sequence counter and SSRC.
/// Supports two packetization modes:
///
/// - **Single NAL Unit** (§5.6): NALs that fit within the payload budget
///   are sent as-is in a single RTP packet (12-byte header + NAL bytes).
///
/// - **FU-A Fragmentation** (§5.8): larger NALs are split across multiple
///   RTP packets. Each fragment carries a 2-byte FU header before the NAL
///   payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to budget - 2 bytes)
///   ```
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    payload_budget: usize,
    parameter_sets: Option<CodecConfig>,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            payload_budget: DEFAULT_RTP_PAYLOAD_BUDGET,
            parameter_sets: None,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            payload_budget: DEFAULT_RTP_PAYLOAD_BUDGET,
            parameter_sets: None,
        }
    }

    /// Override the payload budget, clamped to `3..=MAX_PAYLOAD_BUDGET`: a
    /// fragment always carries at least one byte and every packet fits the
    /// 16-bit length of an interleaved frame.
    pub fn with_payload_budget(mut self, budget: usize) -> Self {
        self.payload_budget = budget.clamp(3, MAX_PAYLOAD_BUDGET);
        self
    }

    /// Set the 90 kHz timestamp used by subsequent [`packetize`](Self::packetize) calls.
    pub fn set_clock(&mut self, clock_90k: u64) {
        self.header.set_timestamp(clock_90k);
    }

    /// Packetize one NAL unit (no start code).
    ///
    /// The marker bit is set on the last packet produced for the unit.
    pub fn packetize(&mut self, nal_unit: &[u8], is_key_frame: bool) -> Vec<Vec<u8>> {
        let packets = self.packetize_nal(nal_unit, true);
        tracing::trace!(
            is_key_frame,
            nal_size = nal_unit.len(),
            rtp_packets = packets.len(),
            "NAL packetized"
        );
        packets
    }

    /// If the NAL fits within the payload budget it is sent as a Single NAL
    /// Unit packet (RFC 6184 §5.6). Otherwise FU-A fragmentation is used
    /// (RFC 6184 §5.8).
    fn packetize_nal(&mut self, nal_unit: &[u8], marker_on_last: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.payload_budget {
            let hdr = self.header.write(marker_on_last);
            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
            return packets;
        }

        let nal_header = nal_unit[0];
        let nal_type = nal_header & 0x1f;
        // F and NRI carry over from the original header.
        let fu_indicator = (nal_header & 0xe0) | NAL_FU_A;
        let payload = &nal_unit[1..];

        let max_fragment = self.payload_budget - 2;
        let fragment_count = payload.len().div_ceil(max_fragment);

        for (index, chunk) in payload.chunks(max_fragment).enumerate() {
            let first = index == 0;
            let last = index + 1 == fragment_count;

            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | nal_type;

            let hdr = self.header.write(marker_on_last && last);

            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + 2 + chunk.len());
            packet.extend_from_slice(&hdr);
            packet.push(fu_indicator);
            packet.push(fu_header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }

        tracing::trace!(
            nal_type,
            nal_size = nal_unit.len(),
            fragments = packets.len(),
            "FU-A fragmented NAL unit"
        );

        packets
    }
}

impl Packetizer for H264Packetizer {
    /// Packetize every NAL of the access unit. The marker is set only on the
    /// final packet of the unit. Keyframes without in-band parameter sets
    /// get the cached SPS/PPS prepended so a client joining mid-stream can
    /// start decoding.
    fn packetize_sample(&mut self, sample: &EncodedSample) -> Vec<Vec<u8>> {
        self.header.set_timestamp(sample.clock_90k);

        let injected: Vec<Vec<u8>> = match &self.parameter_sets {
            Some(config) if sample.key_frame && !sample.has_parameter_sets() => {
                std::iter::once(config.sps.clone())
                    .chain(config.pps.clone())
                    .collect()
            }
            _ => Vec::new(),
        };
        let nal_units: Vec<&[u8]> = injected
            .iter()
            .map(Vec::as_slice)
            .chain(sample.nal_units())
            .collect();

        let mut packets = Vec::new();
        let count = nal_units.len();
        for (i, nal) in nal_units.into_iter().enumerate() {
            packets.append(&mut self.packetize_nal(nal, i + 1 == count));
        }

        tracing::trace!(
            nal_count = count,
            rtp_packets = packets.len(),
            frame_bytes = sample.data.len(),
            key_frame = sample.key_frame,
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        packets
    }

    fn update_format(&mut self, format: &StreamFormat) {
        self.parameter_sets = Some(format.config.clone());
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp::ParsedHeader;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD)
    }

    fn sample(data: Vec<u8>, key_frame: bool, clock_90k: u64) -> EncodedSample {
        EncodedSample {
            data,
            key_frame,
            pts_us: 0,
            frame_index: 0,
            clock_90k,
            epoch: 1,
        }
    }

    /// Pseudo-random NAL body without any zero bytes.
    fn nal_of_len(header: u8, len: usize) -> Vec<u8> {
        let mut nal = vec![header];
        nal.extend((1..len).map(|i| (i * 31 % 251 + 1) as u8));
        nal
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = extract_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42][..], &[0x68, 0xCE][..]]);
    }

    #[test]
    fn extract_empty_and_garbage() {
        assert!(extract_nal_units(&[]).is_empty());
        assert!(extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Annex B / AVCC ---

    #[test]
    fn avcc_conversion_round_trips() {
        let nals = [nal_of_len(0x67, 9), nal_of_len(0x68, 4), nal_of_len(0x65, 3000)];
        let annexb: Vec<u8> = nals
            .iter()
            .flat_map(|n| [&[0u8, 0, 0, 1][..], n].concat())
            .collect();

        let avcc = annexb_to_avcc(&annexb);
        assert_eq!(avcc.len(), annexb.len(), "4-byte start codes become 4-byte lengths");
        assert_eq!(&avcc[0..4], &9u32.to_be_bytes());
        assert!(!avcc.windows(4).any(|w| w == [0, 0, 0, 1]));

        assert_eq!(avcc_to_annexb(&avcc).unwrap(), annexb);
    }

    #[test]
    fn avcc_with_truncated_length_is_rejected() {
        assert!(avcc_to_annexb(&[0, 0, 0, 10, 0x65]).is_none());
        assert!(avcc_to_annexb(&[0, 0]).is_none());
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet_with_marker() {
        let mut p = make_packetizer();
        for len in [1, 2, 100, DEFAULT_RTP_PAYLOAD_BUDGET] {
            let nal = nal_of_len(0x41, len);
            let packets = p.packetize(&nal, false);
            assert_eq!(packets.len(), 1, "len {len}");
            assert_eq!(packets[0].len(), RTP_HEADER_LEN + len);
            assert!(ParsedHeader::parse(&packets[0]).unwrap().marker);
            assert_eq!(&packets[0][RTP_HEADER_LEN..], &nal[..]);
        }
    }

    #[test]
    fn oversized_budget_is_clamped_to_interleaved_frame() {
        let mut p = H264Packetizer::new(96, 1).with_payload_budget(200_000);
        let packets = p.packetize(&nal_of_len(0x65, 150_000), true);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|pkt| pkt.len() <= u16::MAX as usize));
        assert_eq!(packets[0].len(), u16::MAX as usize);
    }

    #[test]
    fn fu_a_fragments_reconstruct_original_nal() {
        for len in [
            DEFAULT_RTP_PAYLOAD_BUDGET + 1,
            DEFAULT_RTP_PAYLOAD_BUDGET * 2,
            DEFAULT_RTP_PAYLOAD_BUDGET * 3 + 17,
            50_000,
        ] {
            let mut p = make_packetizer();
            let nal = nal_of_len(0x65, len);
            let packets = p.packetize(&nal, true);
            assert!(packets.len() > 1);

            let mut rebuilt = Vec::new();
            for (i, packet) in packets.iter().enumerate() {
                let fu_indicator = packet[RTP_HEADER_LEN];
                let fu_header = packet[RTP_HEADER_LEN + 1];
                assert_eq!(fu_indicator & 0x1f, NAL_FU_A);
                assert_eq!(fu_header & 0x1f, 0x05, "original type in FU header");
                assert_eq!(fu_header & 0x80 != 0, i == 0, "start bit");
                assert_eq!(fu_header & 0x40 != 0, i == packets.len() - 1, "end bit");
                assert_eq!(
                    ParsedHeader::parse(packet).unwrap().marker,
                    i == packets.len() - 1,
                    "marker only on final fragment"
                );
                assert!(packet.len() - RTP_HEADER_LEN <= DEFAULT_RTP_PAYLOAD_BUDGET);
                if i == 0 {
                    rebuilt.push((fu_indicator & 0xe0) | (fu_header & 0x1f));
                }
                rebuilt.extend_from_slice(&packet[RTP_HEADER_LEN + 2..]);
            }
            assert_eq!(rebuilt, nal, "len {len}");
        }
    }

    #[test]
    fn empty_nal_no_packets() {
        let mut p = make_packetizer();
        assert!(p.packetize(&[], true).is_empty());
    }

    #[test]
    fn sequence_numbers_increase_across_calls() {
        let mut p = make_packetizer();
        let mut seqs = Vec::new();
        for clock in [0u64, 3000, 6000] {
            let data = [&[0u8, 0, 0, 1][..], &nal_of_len(0x65, 4000)].concat();
            for packet in p.packetize_sample(&sample(data, true, clock)) {
                seqs.push(ParsedHeader::parse(&packet).unwrap().sequence);
            }
        }
        assert!(seqs.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    }

    #[test]
    fn timestamps_follow_sample_clock() {
        let mut p = make_packetizer();
        let mut last = 0u32;
        for frame in 0..5u64 {
            let clock = crate::media::rtp::clock_for_frame(frame, 30);
            let packets = p.packetize_sample(&sample(vec![0, 0, 0, 1, 0x41, 0x9a], false, clock));
            let ts = ParsedHeader::parse(&packets[0]).unwrap().timestamp;
            assert!(ts >= last);
            assert_eq!(ts as u64, frame * 3000);
            last = ts;
        }
        assert_eq!(p.next_rtp_timestamp(), 12_000);
    }

    #[test]
    fn access_unit_marker_only_on_last_packet() {
        let mut p = make_packetizer();
        let data = [
            &[0u8, 0, 0, 1, 0x06, 0x05, 0x01][..],
            &[0, 0, 0, 1][..],
            &nal_of_len(0x65, 3000),
        ]
        .concat();
        let packets = p.packetize_sample(&sample(data, true, 0));
        let markers: Vec<bool> = packets
            .iter()
            .map(|pk| ParsedHeader::parse(pk).unwrap().marker)
            .collect();
        assert_eq!(markers.iter().filter(|m| **m).count(), 1);
        assert_eq!(markers.last(), Some(&true));
    }

    #[test]
    fn keyframe_gets_cached_parameter_sets() {
        let mut p = make_packetizer();
        let sps = vec![0x67, 0x42, 0xc0, 0x1f];
        let pps = vec![0x68, 0xce, 0x3c, 0x80];
        p.update_format(&StreamFormat {
            config: CodecConfig {
                sps: sps.clone(),
                pps: Some(pps.clone()),
            },
            width: 640,
            height: 480,
            fps: 30,
            epoch: 1,
        });

        let packets = p.packetize_sample(&sample(vec![0, 0, 0, 1, 0x65, 0x88, 0x84], true, 0));
        assert_eq!(packets.len(), 3);
        assert_eq!(&packets[0][RTP_HEADER_LEN..], &sps[..]);
        assert_eq!(&packets[1][RTP_HEADER_LEN..], &pps[..]);

        let packets = p.packetize_sample(&sample(vec![0, 0, 0, 1, 0x41, 0x9a], false, 3000));
        assert_eq!(packets.len(), 1, "delta frames are sent as-is");
    }

    #[test]
    fn sdp_attributes_with_config() {
        let config = CodecConfig {
            sps: vec![0x67, 0x64, 0x00, 0x28],
            pps: Some(vec![0x68, 0xee]),
        };
        let attrs = sdp_attributes(96, Some(&config));
        assert_eq!(attrs[0], "a=rtpmap:96 H264/90000");
        assert!(attrs[1].starts_with("a=fmtp:96 packetization-mode=1;profile-level-id=640028;"));
        assert!(attrs[1].contains("sprop-parameter-sets="));
        assert_eq!(attrs[2], "a=control:track1");
    }

    #[test]
    fn codec_metadata() {
        let p = make_packetizer();
        assert_eq!(p.codec_name(), "H264");
        assert_eq!(p.clock_rate(), 90000);
        assert_eq!(p.payload_type(), 96);
        assert_eq!(p.ssrc(), 0xAABBCCDD);
    }
}
