use std::sync::Arc;

use super::muxer::Mp4Muxer;
use crate::media::rtp::VIDEO_CLOCK_RATE;
use crate::media::{EncodedSample, StreamEvent, StreamFormat};

/// Per-consumer fMP4 byte stream state.
///
/// Turns the encode loop's [`StreamEvent`]s into the chunks an HTTP writer
/// sends: one init segment per configuration epoch, emitted right before
/// that epoch's first fragment, then one `moof`+`mdat` per sample. A
/// consumer that joins mid-stream, or crosses into a new epoch, skips delta
/// frames until the next keyframe.
#[derive(Debug, Default)]
pub struct Fmp4Stream {
    format: Option<Arc<StreamFormat>>,
    muxer: Option<Mp4Muxer>,
    init_sent: bool,
    next_sequence: u32,
    fragments: u64,
}

impl Fmp4Stream {
    pub fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Self::default()
        }
    }

    /// Start from an already-known format (e.g. the bus's latest).
    pub fn with_format(format: Option<Arc<StreamFormat>>) -> Self {
        let mut stream = Self::new();
        if let Some(format) = format {
            stream.set_format(format);
        }
        stream
    }

    /// Feed one event; returns the byte chunks to write, in order.
    pub fn push(&mut self, event: &StreamEvent) -> Vec<Vec<u8>> {
        match event {
            StreamEvent::Format(format) => {
                self.set_format(format.clone());
                Vec::new()
            }
            StreamEvent::Sample(sample) => self.push_sample(sample),
        }
    }

    /// Configuration epoch the stream is currently muxing.
    pub fn epoch(&self) -> Option<u32> {
        self.format.as_ref().map(|f| f.epoch)
    }

    /// Number of fragments emitted so far.
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    fn set_format(&mut self, format: Arc<StreamFormat>) {
        if self.format.as_ref().is_some_and(|f| **f == *format) {
            return;
        }
        tracing::debug!(epoch = format.epoch, "fMP4 stream switched format");
        self.muxer = Some(Mp4Muxer::new(format.fps));
        self.format = Some(format);
        self.init_sent = false;
    }

    fn push_sample(&mut self, sample: &EncodedSample) -> Vec<Vec<u8>> {
        let (Some(format), Some(muxer)) = (&self.format, &self.muxer) else {
            return Vec::new();
        };
        if sample.epoch != format.epoch {
            return Vec::new();
        }

        let mut chunks = Vec::with_capacity(2);
        if !self.init_sent {
            if !sample.key_frame {
                return chunks;
            }
            match muxer.init_segment(Some(&format.config), format.width, format.height) {
                Some(init) => chunks.push(init),
                None => return chunks,
            }
            self.init_sent = true;
        }

        // Decode time on the media timescale (= fps), rounded to the
        // nearest tick so it stays continuous across epochs.
        let timescale = muxer.timescale() as u64;
        let half = VIDEO_CLOCK_RATE as u64 / 2;
        let decode_time = (sample.clock_90k * timescale + half) / VIDEO_CLOCK_RATE as u64;

        chunks.push(muxer.fragment(self.next_sequence, decode_time, sample));
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.fragments += 1;
        chunks
    }
}
