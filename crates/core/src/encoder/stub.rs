//! Deterministic software H.264 stand-in.
//!
//! Produces syntactically plausible Annex-B access units without doing any
//! real compression: a format-changed event carrying SPS and PPS in two
//! separate configuration buffers, then one access unit per queued frame
//! with IDR slices at the configured keyframe interval. Payload sizes follow
//! the configured bitrate so that large keyframes exercise FU-A
//! fragmentation downstream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ColorFormat, Encoder, EncoderFactory, EncoderOutput, EncoderSettings};
use crate::error::{Result, StreamError};
use crate::media::h264::{NAL_IDR, NAL_PPS, NAL_SLICE, NAL_SPS};

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const PPS_BODY: [u8; 3] = [0xce, 0x3c, 0x80];
const DEFAULT_INPUT_CAPACITY: usize = 4;

/// Creates [`StubEncoder`]s and keeps shared counters tests can inspect.
#[derive(Debug, Clone)]
pub struct StubEncoderFactory {
    supported: Vec<ColorFormat>,
    preferred: Option<ColorFormat>,
    input_capacity: usize,
    fail_configure: Arc<AtomicBool>,
    created: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    configured: Arc<Mutex<Vec<EncoderSettings>>>,
}

impl Default for StubEncoderFactory {
    fn default() -> Self {
        Self {
            supported: vec![ColorFormat::SemiPlanar, ColorFormat::Planar],
            preferred: None,
            input_capacity: DEFAULT_INPUT_CAPACITY,
            fail_configure: Arc::new(AtomicBool::new(false)),
            created: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            configured: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl StubEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color_formats(mut self, supported: Vec<ColorFormat>) -> Self {
        self.supported = supported;
        self
    }

    pub fn with_preferred(mut self, preferred: ColorFormat) -> Self {
        self.preferred = Some(preferred);
        self
    }

    /// Number of frames the encoder holds before `queue_input` reports no
    /// free buffer.
    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    /// Shared switch that makes every subsequent `configure` fail while set.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        self.fail_configure.clone()
    }

    /// Encoders created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Encoders created and not yet stopped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Every settings value successfully configured, oldest first.
    pub fn configured(&self) -> Vec<EncoderSettings> {
        self.configured.lock().clone()
    }
}

impl EncoderFactory for StubEncoderFactory {
    fn create(&self) -> Result<Box<dyn Encoder>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubEncoder {
            supported: self.supported.clone(),
            preferred: self.preferred,
            input_capacity: self.input_capacity.max(1),
            fail_configure: self.fail_configure.clone(),
            live: self.live.clone(),
            configured: self.configured.clone(),
            settings: None,
            outputs: VecDeque::new(),
            pending: VecDeque::new(),
            frames: 0,
            stopped: false,
        }))
    }
}

/// See the module documentation.
#[derive(Debug)]
pub struct StubEncoder {
    supported: Vec<ColorFormat>,
    preferred: Option<ColorFormat>,
    input_capacity: usize,
    fail_configure: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    configured: Arc<Mutex<Vec<EncoderSettings>>>,
    settings: Option<EncoderSettings>,
    outputs: VecDeque<EncoderOutput>,
    pending: VecDeque<u64>,
    frames: u64,
    stopped: bool,
}

impl StubEncoder {
    fn sps(settings: &EncoderSettings) -> Vec<u8> {
        let pixels = settings.width as u64 * settings.height as u64;
        let level = match pixels {
            p if p <= 1280 * 720 => 0x1f,
            p if p <= 1920 * 1080 => 0x28,
            _ => 0x33,
        };
        // profile_idc 66 (baseline), constraint_set0/1.
        let mut sps = vec![0x60 | NAL_SPS, 0x42, 0xc0, level];
        for dim in [settings.width, settings.height] {
            sps.extend_from_slice(&((dim / 16).max(1) as u16).to_be_bytes().map(|b| b | 0x80));
        }
        sps
    }

    fn config_buffers(settings: &EncoderSettings) -> Vec<Vec<u8>> {
        let pps = [&[0x60 | NAL_PPS][..], &PPS_BODY].concat();
        vec![
            [&START_CODE[..], &Self::sps(settings)].concat(),
            [&START_CODE[..], &pps].concat(),
        ]
    }

    fn encode(&mut self, settings: &EncoderSettings, pts_us: u64) -> EncoderOutput {
        let gop = (settings.fps.max(1) as u64 * settings.keyframe_interval_secs.max(1) as u64).max(1);
        let key_frame = self.frames % gop == 0;
        let per_frame = (settings.bitrate / 8 / settings.fps.max(1)) as usize;
        let len = if key_frame { per_frame * 3 } else { per_frame }.clamp(16, 512 * 1024);

        let header = if key_frame { 0x60 | NAL_IDR } else { 0x40 | NAL_SLICE };
        let seed = self.frames as usize;
        let mut payload = Vec::with_capacity(START_CODE.len() + 1 + len);
        payload.extend_from_slice(&START_CODE);
        payload.push(header);
        payload.extend((0..len).map(|i| ((i + seed) % 251) as u8 + 1));

        self.frames += 1;
        EncoderOutput::Data {
            payload,
            key_frame,
            pts_us,
        }
    }
}

impl Encoder for StubEncoder {
    fn name(&self) -> &str {
        "stub-h264"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn preferred_color_format(&self) -> Option<ColorFormat> {
        self.preferred
    }

    fn supported_color_formats(&self) -> &[ColorFormat] {
        &self.supported
    }

    fn configure(&mut self, settings: &EncoderSettings) -> Result<()> {
        if self.fail_configure.load(Ordering::Relaxed) {
            return Err(StreamError::EncoderConfigure(
                "stub encoder configured to fail".into(),
            ));
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(StreamError::EncoderConfigure(format!(
                "unsupported size {}x{}",
                settings.width, settings.height
            )));
        }
        self.outputs.push_back(EncoderOutput::FormatChanged {
            config_buffers: Self::config_buffers(settings),
        });
        self.configured.lock().push(settings.clone());
        self.settings = Some(settings.clone());
        Ok(())
    }

    fn queue_input(&mut self, frame: &[u8], pts_us: u64, _timeout: Duration) -> Result<bool> {
        let Some(settings) = &self.settings else {
            return Err(StreamError::EncoderUnavailable);
        };
        if self.stopped {
            return Err(StreamError::EncoderUnavailable);
        }
        let expected = super::convert::converted_len(settings.width, settings.height);
        if frame.len() != expected {
            return Err(StreamError::InvalidFrame(format!(
                "expected {expected} input bytes, got {}",
                frame.len()
            )));
        }
        if self.pending.len() >= self.input_capacity {
            return Ok(false);
        }
        self.pending.push_back(pts_us);
        Ok(true)
    }

    fn drain_next(&mut self) -> Option<EncoderOutput> {
        if let Some(output) = self.outputs.pop_front() {
            return Some(output);
        }
        let settings = self.settings.clone()?;
        let pts_us = self.pending.pop_front()?;
        Some(self.encode(&settings, pts_us))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.pending.clear();
        self.outputs.clear();
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for StubEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}
