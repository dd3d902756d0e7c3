use crate::error::{Result, StreamError};

/// One plane of a raw frame, addressed through explicit strides.
///
/// `row_stride` is the byte distance between rows, `pixel_stride` the byte
/// distance between horizontally adjacent samples (2 for a chroma plane
/// that is a view into an interleaved buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    /// Tightly packed plane: `pixel_stride == 1`, `row_stride == width`.
    pub fn packed(data: Vec<u8>, width: usize) -> Self {
        Self {
            data,
            row_stride: width,
            pixel_stride: 1,
        }
    }

    #[inline]
    pub fn at(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.row_stride + col * self.pixel_stride]
    }

    /// Whether `cols` x `rows` samples can be read without running off the
    /// end of the buffer.
    fn covers(&self, cols: usize, rows: usize) -> bool {
        if cols == 0 || rows == 0 {
            return true;
        }
        let last = (rows - 1) * self.row_stride + (cols - 1) * self.pixel_stride;
        self.pixel_stride > 0 && self.row_stride >= cols && last < self.data.len()
    }

    /// Rows are contiguous and back to back.
    pub fn is_contiguous(&self, cols: usize) -> bool {
        self.pixel_stride == 1 && self.row_stride == cols
    }
}

/// A raw YUV 4:2:0 frame from the frame source: one luma and two chroma
/// planes with their own strides.
///
/// Borrowed for the duration of one `submit_frame` call and never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Y, U, V.
    pub planes: [Plane; 3],
    /// Capture time in microseconds. Informational only; presentation time
    /// comes from the frame counter.
    pub capture_time_us: u64,
}

impl RawFrame {
    pub fn luma_size(&self) -> (usize, usize) {
        (self.width as usize, self.height as usize)
    }

    pub fn chroma_size(&self) -> (usize, usize) {
        (self.width.div_ceil(2) as usize, self.height.div_ceil(2) as usize)
    }

    pub fn y(&self) -> &Plane {
        &self.planes[0]
    }

    pub fn u(&self) -> &Plane {
        &self.planes[1]
    }

    pub fn v(&self) -> &Plane {
        &self.planes[2]
    }

    /// Check that every plane is large enough for its declared strides.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::InvalidFrame(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        let (w, h) = self.luma_size();
        let (cw, ch) = self.chroma_size();
        for (name, plane, cols, rows) in [
            ("Y", self.y(), w, h),
            ("U", self.u(), cw, ch),
            ("V", self.v(), cw, ch),
        ] {
            if !plane.covers(cols, rows) {
                return Err(StreamError::InvalidFrame(format!(
                    "{name} plane too small: {} bytes, row_stride {}, pixel_stride {} for {cols}x{rows}",
                    plane.data.len(),
                    plane.row_stride,
                    plane.pixel_stride
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, y_stride: usize) -> RawFrame {
        let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
        RawFrame {
            width,
            height,
            planes: [
                Plane {
                    data: vec![16; y_stride * height as usize],
                    row_stride: y_stride,
                    pixel_stride: 1,
                },
                Plane::packed(vec![128; cw * ch], cw),
                Plane::packed(vec![128; cw * ch], cw),
            ],
            capture_time_us: 0,
        }
    }

    #[test]
    fn padded_frame_is_valid() {
        assert!(frame(6, 4, 8).validate().is_ok());
    }

    #[test]
    fn short_plane_is_rejected() {
        let mut f = frame(6, 4, 6);
        f.planes[0].data.truncate(20);
        assert!(matches!(f.validate(), Err(StreamError::InvalidFrame(_))));
    }

    #[test]
    fn row_stride_narrower_than_width_is_rejected() {
        let f = frame(6, 4, 4);
        assert!(f.validate().is_err());
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let f = frame(5, 3, 5);
        assert_eq!(f.chroma_size(), (3, 2));
        assert!(f.validate().is_ok());
    }
}
