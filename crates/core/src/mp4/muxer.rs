use super::boxes::Mp4Box;
use crate::media::h264::annexb_to_avcc;
use crate::media::{CodecConfig, EncodedSample};

/// The only track in the presentation.
pub const TRACK_ID: u32 = 1;

const MAJOR_BRAND: &[u8; 4] = b"isom";
const MINOR_VERSION: u32 = 0x200;
const COMPATIBLE_BRANDS: [&[u8; 4]; 5] = [b"isom", b"iso6", b"iso2", b"avc1", b"mp41"];

const IDENTITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SAMPLE_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;

/// `sample_depends_on = 2`: an independently decodable sample.
const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
/// `sample_depends_on = 1`, `sample_is_non_sync_sample = 1`.
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// Fragmented MP4 box builder for a single live H.264 track.
///
/// ```text
/// init segment:  ftyp
///                moov ─ mvhd
///                     ├ trak ─ tkhd
///                     │      └ mdia ─ mdhd, hdlr
///                     │             └ minf ─ vmhd, dinf ─ dref ─ url
///                     │                    └ stbl ─ stsd ─ avc1 ─ avcC
///                     │                           └ stts, stsc, stsz, stco (empty)
///                     └ mvex ─ trex
///
/// fragment:      moof ─ mfhd
///                     └ traf ─ tfhd, tfdt, trun
///                mdat
/// ```
///
/// The movie and media timescale is the frame rate, so one sample lasts one
/// tick.
#[derive(Debug, Clone, Copy)]
pub struct Mp4Muxer {
    timescale: u32,
}

impl Mp4Muxer {
    pub fn new(fps: u32) -> Self {
        Self {
            timescale: fps.max(1),
        }
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    /// `ftyp` + `moov` for the given codec configuration. `None` until the
    /// encoder has produced one.
    pub fn init_segment(
        &self,
        config: Option<&CodecConfig>,
        width: u32,
        height: u32,
    ) -> Option<Vec<u8>> {
        let config = config?;

        let mut out = Vec::new();
        self.ftyp().write_to(&mut out);
        self.moov(config, width, height).write_to(&mut out);

        tracing::debug!(
            bytes = out.len(),
            width,
            height,
            timescale = self.timescale,
            "fMP4 init segment built"
        );
        Some(out)
    }

    /// `moof` + `mdat` carrying exactly one sample.
    ///
    /// The sample's Annex B payload is rewritten to 4-byte length-prefixed
    /// NAL units before it goes into `mdat`.
    pub fn fragment(&self, sequence_number: u32, base_decode_time: u64, sample: &EncodedSample) -> Vec<u8> {
        let payload = annexb_to_avcc(&sample.data);
        let sample_size = payload.len() as u32;

        // The trun data offset counts from the start of moof to the first
        // mdat payload byte; moof's size does not depend on the offset value.
        let sizing = self.moof(sequence_number, base_decode_time, sample.key_frame, sample_size, 0);
        let data_offset = (sizing.size() + super::boxes::BOX_HEADER_LEN) as i32;
        let moof = self.moof(
            sequence_number,
            base_decode_time,
            sample.key_frame,
            sample_size,
            data_offset,
        );
        let mdat = Mp4Box::new(b"mdat").bytes(&payload);

        let mut out = Vec::with_capacity(moof.size() + mdat.size());
        moof.write_to(&mut out);
        mdat.write_to(&mut out);

        tracing::trace!(
            sequence_number,
            base_decode_time,
            key_frame = sample.key_frame,
            sample_size,
            "fMP4 fragment built"
        );
        out
    }

    fn ftyp(&self) -> Mp4Box {
        let mut ftyp = Mp4Box::new(b"ftyp").bytes(MAJOR_BRAND).u32(MINOR_VERSION);
        for brand in COMPATIBLE_BRANDS {
            ftyp = ftyp.bytes(brand);
        }
        ftyp
    }

    fn moov(&self, config: &CodecConfig, width: u32, height: u32) -> Mp4Box {
        Mp4Box::new(b"moov")
            .child(self.mvhd())
            .child(self.trak(config, width, height))
            .child(
                Mp4Box::new(b"mvex").child(
                    Mp4Box::full(b"trex", 0, 0)
                        .u32(TRACK_ID)
                        .u32(1) // default_sample_description_index
                        .u32(0) // default_sample_duration
                        .u32(0) // default_sample_size
                        .u32(0), // default_sample_flags
                ),
            )
    }

    fn mvhd(&self) -> Mp4Box {
        let mvhd = Mp4Box::full(b"mvhd", 0, 0)
            .u32(0) // creation_time
            .u32(0) // modification_time
            .u32(self.timescale)
            .u32(0) // duration: unknown for live
            .u32(0x00010000) // rate 1.0
            .u16(0x0100) // volume 1.0
            .zeros(2 + 8);
        with_matrix(mvhd).zeros(24).u32(TRACK_ID + 1)
    }

    fn trak(&self, config: &CodecConfig, width: u32, height: u32) -> Mp4Box {
        let tkhd = Mp4Box::full(b"tkhd", 0, 0x000003) // enabled | in movie
            .u32(0)
            .u32(0)
            .u32(TRACK_ID)
            .u32(0)
            .u32(0) // duration
            .zeros(8)
            .i16(0) // layer
            .i16(0) // alternate_group
            .i16(0) // volume
            .u16(0);
        let tkhd = with_matrix(tkhd).u32(width << 16).u32(height << 16);

        let mdhd = Mp4Box::full(b"mdhd", 0, 0)
            .u32(0)
            .u32(0)
            .u32(self.timescale)
            .u32(0)
            .u16(0x55c4) // language "und"
            .u16(0);

        let hdlr = Mp4Box::full(b"hdlr", 0, 0)
            .u32(0)
            .bytes(b"vide")
            .zeros(12)
            .bytes(b"VideoHandler\0");

        let vmhd = Mp4Box::full(b"vmhd", 0, 1).u16(0).zeros(6);
        let dinf = Mp4Box::new(b"dinf").child(
            Mp4Box::full(b"dref", 0, 0)
                .u32(1)
                .child(Mp4Box::full(b"url ", 0, 1)), // self-contained
        );

        let stbl = Mp4Box::new(b"stbl")
            .child(
                Mp4Box::full(b"stsd", 0, 0)
                    .u32(1)
                    .child(avc1(config, width, height)),
            )
            .child(Mp4Box::full(b"stts", 0, 0).u32(0))
            .child(Mp4Box::full(b"stsc", 0, 0).u32(0))
            .child(Mp4Box::full(b"stsz", 0, 0).u32(0).u32(0))
            .child(Mp4Box::full(b"stco", 0, 0).u32(0));

        let minf = Mp4Box::new(b"minf").child(vmhd).child(dinf).child(stbl);
        let mdia = Mp4Box::new(b"mdia").child(mdhd).child(hdlr).child(minf);

        Mp4Box::new(b"trak").child(tkhd).child(mdia)
    }

    fn moof(
        &self,
        sequence_number: u32,
        base_decode_time: u64,
        key_frame: bool,
        sample_size: u32,
        data_offset: i32,
    ) -> Mp4Box {
        let sample_flags = if key_frame {
            SYNC_SAMPLE_FLAGS
        } else {
            NON_SYNC_SAMPLE_FLAGS
        };
        let tfhd = Mp4Box::full(
            b"tfhd",
            0,
            TFHD_DEFAULT_BASE_IS_MOOF | TFHD_DEFAULT_SAMPLE_DURATION | TFHD_DEFAULT_SAMPLE_FLAGS,
        )
        .u32(TRACK_ID)
        .u32(1) // one tick per sample
        .u32(sample_flags);
        let tfdt = Mp4Box::full(b"tfdt", 1, 0).u64(base_decode_time);
        let trun = Mp4Box::full(b"trun", 0, TRUN_DATA_OFFSET | TRUN_SAMPLE_SIZE)
            .u32(1) // sample_count
            .i32(data_offset)
            .u32(sample_size);

        Mp4Box::new(b"moof")
            .child(Mp4Box::full(b"mfhd", 0, 0).u32(sequence_number))
            .child(Mp4Box::new(b"traf").child(tfhd).child(tfdt).child(trun))
    }
}

fn with_matrix(mut b: Mp4Box) -> Mp4Box {
    for value in IDENTITY_MATRIX {
        b = b.u32(value);
    }
    b
}

fn avc1(config: &CodecConfig, width: u32, height: u32) -> Mp4Box {
    let mut compressor = [0u8; 32];
    let name = b"streamcore";
    compressor[0] = name.len() as u8;
    compressor[1..1 + name.len()].copy_from_slice(name);

    Mp4Box::new(b"avc1")
        .zeros(6)
        .u16(1) // data_reference_index
        .zeros(2 + 2 + 12)
        .u16(width as u16)
        .u16(height as u16)
        .u32(0x00480000) // 72 dpi
        .u32(0x00480000)
        .u32(0)
        .u16(1) // frame_count
        .bytes(&compressor)
        .u16(0x0018) // depth
        .i16(-1)
        .child(avcc(config))
}

/// `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.3.3.1).
fn avcc(config: &CodecConfig) -> Mp4Box {
    let [profile, compat, level] = config.profile_bytes();
    let mut avcc = Mp4Box::new(b"avcC")
        .u8(1) // configurationVersion
        .u8(profile)
        .u8(compat)
        .u8(level)
        .u8(0xfc | 3) // lengthSizeMinusOne = 3
        .u8(0xe0 | 1) // one SPS
        .u16(config.sps.len() as u16)
        .bytes(&config.sps);

    match &config.pps {
        Some(pps) => {
            avcc = avcc.u8(1).u16(pps.len() as u16).bytes(pps);
        }
        None => {
            avcc = avcc.u8(0);
        }
    }
    avcc
}
