//! Raw frame to encoder input layout conversion.
//!
//! Source planes are only ever read; the converted frame is written into a
//! caller-owned buffer that the orchestrator reuses between frames.

use super::{ColorFormat, Plane, RawFrame};
use crate::error::Result;

/// Bytes needed for one converted 4:2:0 frame.
pub fn converted_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    w * h + 2 * cw * ch
}

/// Convert `frame` into `format`, replacing the contents of `out`.
pub fn convert_into(frame: &RawFrame, format: ColorFormat, out: &mut Vec<u8>) -> Result<()> {
    frame.validate()?;

    out.clear();
    out.reserve(converted_len(frame.width, frame.height));

    let (w, h) = frame.luma_size();
    let (cw, ch) = frame.chroma_size();

    copy_plane(frame.y(), w, h, out);
    match format {
        ColorFormat::Planar => {
            copy_plane(frame.u(), cw, ch, out);
            copy_plane(frame.v(), cw, ch, out);
        }
        ColorFormat::SemiPlanar => interleave(frame.u(), frame.v(), cw, ch, out),
        ColorFormat::InterleavedVu => interleave(frame.v(), frame.u(), cw, ch, out),
    }
    Ok(())
}

fn copy_plane(plane: &Plane, cols: usize, rows: usize, out: &mut Vec<u8>) {
    if plane.is_contiguous(cols) {
        out.extend_from_slice(&plane.data[..cols * rows]);
    } else if plane.pixel_stride == 1 {
        for row in 0..rows {
            let start = row * plane.row_stride;
            out.extend_from_slice(&plane.data[start..start + cols]);
        }
    } else {
        for row in 0..rows {
            out.extend((0..cols).map(|col| plane.at(row, col)));
        }
    }
}

fn interleave(first: &Plane, second: &Plane, cols: usize, rows: usize, out: &mut Vec<u8>) {
    if first.is_contiguous(cols) && second.is_contiguous(cols) {
        let n = cols * rows;
        for (a, b) in first.data[..n].iter().zip(&second.data[..n]) {
            out.push(*a);
            out.push(*b);
        }
        return;
    }
    for row in 0..rows {
        for col in 0..cols {
            out.push(first.at(row, col));
            out.push(second.at(row, col));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x2 frame: Y = 0..8, U = [100, 101], V = [200, 201].
    fn packed_frame() -> RawFrame {
        RawFrame {
            width: 4,
            height: 2,
            planes: [
                Plane::packed((0..8).collect(), 4),
                Plane::packed(vec![100, 101], 2),
                Plane::packed(vec![200, 201], 2),
            ],
            capture_time_us: 0,
        }
    }

    /// Same picture as `packed_frame`, but with padded rows and chroma
    /// planes that are strided views into one interleaved VU buffer.
    fn strided_frame() -> RawFrame {
        let y = vec![0, 1, 2, 3, 0xEE, 0xEE, 4, 5, 6, 7, 0xEE, 0xEE];
        let vu = vec![200, 100, 201, 101];
        RawFrame {
            width: 4,
            height: 2,
            planes: [
                Plane {
                    data: y,
                    row_stride: 6,
                    pixel_stride: 1,
                },
                Plane {
                    data: vu[1..].to_vec(),
                    row_stride: 4,
                    pixel_stride: 2,
                },
                Plane {
                    data: vu.clone(),
                    row_stride: 4,
                    pixel_stride: 2,
                },
            ],
            capture_time_us: 0,
        }
    }

    #[test]
    fn planar_fast_path() {
        let mut out = Vec::new();
        convert_into(&packed_frame(), ColorFormat::Planar, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 4, 5, 6, 7, 100, 101, 200, 201]);
    }

    #[test]
    fn semi_planar_and_vu_fast_path() {
        let mut out = Vec::new();
        convert_into(&packed_frame(), ColorFormat::SemiPlanar, &mut out).unwrap();
        assert_eq!(&out[8..], &[100, 200, 101, 201]);

        convert_into(&packed_frame(), ColorFormat::InterleavedVu, &mut out).unwrap();
        assert_eq!(&out[8..], &[200, 100, 201, 101]);
        assert_eq!(out.len(), converted_len(4, 2));
    }

    #[test]
    fn strided_path_matches_fast_path() {
        for format in [
            ColorFormat::Planar,
            ColorFormat::SemiPlanar,
            ColorFormat::InterleavedVu,
        ] {
            let mut fast = Vec::new();
            let mut slow = Vec::new();
            convert_into(&packed_frame(), format, &mut fast).unwrap();
            convert_into(&strided_frame(), format, &mut slow).unwrap();
            assert_eq!(fast, slow, "{format:?}");
        }
    }

    #[test]
    fn source_is_left_untouched() {
        let frame = strided_frame();
        let before = frame.clone();
        let mut out = vec![9; 64];
        convert_into(&frame, ColorFormat::SemiPlanar, &mut out).unwrap();
        assert_eq!(frame, before);
        assert_eq!(out.len(), converted_len(4, 2), "stale output cleared");
    }

    #[test]
    fn invalid_frame_is_an_error() {
        let mut frame = packed_frame();
        frame.planes[2].data.clear();
        assert!(convert_into(&frame, ColorFormat::Planar, &mut Vec::new()).is_err());
    }
}
