use rand::Rng;

/// RTP clock rate for video (RFC 6184 §8.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Size of the fixed RTP header without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// 90 kHz timestamp of a frame, derived from its index and the nominal
/// frame rate rather than from wall-clock capture time.
pub fn clock_for_frame(frame_index: u64, fps: u32) -> u64 {
    frame_index * VIDEO_CLOCK_RATE as u64 / fps.max(1) as u64
}

/// Generic RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// One instance per session. It manages:
/// - **Sequence number**: 16-bit, wrapping; incremented on every packet.
/// - **Timestamp**: set per access unit from the sample's 90 kHz clock; the
///   lower 32 bits go on the wire.
/// - **SSRC**: fixed for the lifetime of the session.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Create with a random SSRC.
    ///
    /// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let ssrc = rand::rng().random::<u32>();
        Self::new(pt, ssrc)
    }

    /// Current sequence number (before the next [`write`](Self::write) call).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current timestamp (internal u64 representation).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame.
    pub fn write(&mut self, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((marker as u8) << 7) | self.pt;

        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Set the timestamp for the packets of the next access unit.
    pub fn set_timestamp(&mut self, clock_90k: u64) {
        self.timestamp = clock_90k;
    }
}

/// Fields of a serialized RTP packet, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub version: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl ParsedHeader {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN {
            return None;
        }
        Some(Self {
            version: packet[0] >> 6,
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        })
    }
}
