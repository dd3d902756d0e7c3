//! Frame sources feeding the encode loop.

use crate::encoder::{Plane, RawFrame};

/// Pull interface to whatever captures raw frames.
pub trait FrameSource: Send {
    /// Next frame, or `None` if nothing is available right now.
    fn next_frame(&mut self) -> Option<RawFrame>;

    /// Ask the source to capture at a new size. Returns `false` if the
    /// source cannot change resolution.
    fn set_resolution(&mut self, _width: u32, _height: u32) -> bool {
        false
    }
}

/// Synthetic I420 source: a diagonal luma gradient that moves one pixel
/// per frame over flat chroma that slowly cycles.
///
/// With `row_padding` set, every plane row carries that many extra bytes
/// so consumers have to honor the row stride.
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    width: u32,
    height: u32,
    row_padding: usize,
    frame: u64,
    frame_interval_us: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            row_padding: 0,
            frame: 0,
            frame_interval_us: 1_000_000 / fps.max(1) as u64,
        }
    }

    pub fn with_row_padding(mut self, padding: usize) -> Self {
        self.row_padding = padding;
        self
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame
    }

    fn plane(&self, cols: usize, rows: usize, value: impl Fn(usize, usize) -> u8) -> Plane {
        let stride = cols + self.row_padding;
        let mut data = vec![0u8; stride * rows];
        for (row, line) in data.chunks_exact_mut(stride).enumerate() {
            for (col, px) in line[..cols].iter_mut().enumerate() {
                *px = value(row, col);
            }
        }
        Plane {
            data,
            row_stride: stride,
            pixel_stride: 1,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Option<RawFrame> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let shift = self.frame as usize;
        let u = (128 + (self.frame / 4 % 64) as i32 - 32) as u8;
        let v = (128 - (self.frame / 4 % 64) as i32 + 32) as u8;

        let frame = RawFrame {
            width: self.width,
            height: self.height,
            planes: [
                self.plane(w, h, |row, col| (16 + (row + col + shift) % 220) as u8),
                self.plane(cw, ch, |_, _| u),
                self.plane(cw, ch, |_, _| v),
            ],
            capture_time_us: self.frame * self.frame_interval_us,
        };
        self.frame += 1;
        Some(frame)
    }

    fn set_resolution(&mut self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        tracing::info!(width, height, "test pattern resolution changed");
        self.width = width;
        self.height = height;
        true
    }
}
