use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use super::{
    ColorFormat, Encoder, EncoderFactory, EncoderOutput, EncoderSettings, PressureState, RawFrame,
    choose_color_format, convert,
};
use crate::config::{BitrateMode, StreamConfig};
use crate::error::{Result, StreamError};
use crate::media::rtp::clock_for_frame;
use crate::media::{CodecConfig, EncodedSample, StreamEvent, StreamFormat};

/// Counters and identity shared with the control/telemetry layer.
///
/// Written only by the orchestrator; readable from any thread.
#[derive(Debug, Default)]
pub struct EncoderStatus {
    name: RwLock<Option<String>>,
    hardware: AtomicBool,
    color_format: RwLock<Option<ColorFormat>>,
    format: RwLock<Option<Arc<StreamFormat>>>,
    frames_encoded: AtomicU64,
    frames_dropped: AtomicU64,
    reconfigurations: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`EncoderStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSnapshot {
    /// `None` while no encoder is active.
    pub encoder: Option<String>,
    pub hardware: bool,
    pub color_format: Option<&'static str>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub config_ready: bool,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub reconfigurations: u64,
    pub last_error: Option<String>,
}

impl EncoderStatus {
    pub fn snapshot(&self) -> EncoderSnapshot {
        let format = self.format();
        EncoderSnapshot {
            encoder: self.name.read().clone(),
            hardware: self.hardware.load(Ordering::Relaxed),
            color_format: self.color_format.read().map(|f| f.name()),
            width: format.as_ref().map_or(0, |f| f.width),
            height: format.as_ref().map_or(0, |f| f.height),
            fps: format.as_ref().map_or(0, |f| f.fps),
            config_ready: format.is_some(),
            frames_encoded: self.frames_encoded(),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }

    /// Format of the current configuration epoch, once SPS/PPS are known.
    pub fn format(&self) -> Option<Arc<StreamFormat>> {
        self.format.read().clone()
    }

    pub fn encoder_present(&self) -> bool {
        self.name.read().is_some()
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    fn record_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    fn record_drop(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn clear_encoder(&self) {
        *self.name.write() = None;
        *self.color_format.write() = None;
        *self.format.write() = None;
        self.hardware.store(false, Ordering::Relaxed);
    }
}

/// Anchor of the presentation clock. Frame `i` is presented at
/// `pts_us + (i - first_index) / fps` seconds.
#[derive(Debug, Clone, Copy, Default)]
struct Timebase {
    first_index: u64,
    pts_us: u64,
    clock_90k: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    pts_us: u64,
    frame_index: u64,
    clock_90k: u64,
}

/// Mutable state owned by the orchestrator.
#[derive(Debug)]
struct RuntimeState {
    settings: Option<EncoderSettings>,
    fps: u32,
    bitrate_override: Option<u32>,
    bitrate_mode: BitrateMode,
    pressure: PressureState,
    frame_counter: u64,
    timebase: Timebase,
    pending: VecDeque<PendingFrame>,
    codec_config: Option<CodecConfig>,
    epoch: u32,
    last_failure: Option<Instant>,
}

impl RuntimeState {
    fn new(config: &StreamConfig) -> Self {
        Self {
            settings: None,
            fps: config.fps.max(1),
            bitrate_override: None,
            bitrate_mode: config.bitrate_mode,
            pressure: PressureState::Nominal,
            frame_counter: 0,
            timebase: Timebase::default(),
            pending: VecDeque::new(),
            codec_config: None,
            epoch: 0,
            last_failure: None,
        }
    }

    fn pts_for(&self, index: u64) -> u64 {
        let elapsed = index.saturating_sub(self.timebase.first_index);
        self.timebase.pts_us + elapsed * 1_000_000 / self.fps as u64
    }

    fn clock_for(&self, index: u64) -> u64 {
        let elapsed = index.saturating_sub(self.timebase.first_index);
        self.timebase.clock_90k + clock_for_frame(elapsed, self.fps)
    }

    /// Frame index whose presentation time is `pts_us`, for outputs that
    /// no longer match a pending entry.
    fn index_for(&self, pts_us: u64) -> u64 {
        let elapsed = pts_us.saturating_sub(self.timebase.pts_us);
        self.timebase.first_index + (elapsed * self.fps as u64).div_ceil(1_000_000)
    }
}

/// Owns the encoder lifecycle and turns raw frames into encoded samples.
///
/// Runs on a single thread: frames are submitted and drained in order, so
/// drained samples come out in submission order. The frame counter, and
/// therefore every timestamp, keeps counting across encoder
/// reconfigurations.
pub struct EncoderOrchestrator {
    config: StreamConfig,
    factory: Box<dyn EncoderFactory>,
    encoder: Option<Box<dyn Encoder>>,
    state: RuntimeState,
    status: Arc<EncoderStatus>,
    scratch: Vec<u8>,
    format_retired: bool,
}

impl EncoderOrchestrator {
    pub fn new(config: StreamConfig, factory: Box<dyn EncoderFactory>) -> Self {
        let state = RuntimeState::new(&config);
        Self {
            config,
            factory,
            encoder: None,
            state,
            status: Arc::new(EncoderStatus::default()),
            scratch: Vec::new(),
            format_retired: false,
        }
    }

    pub fn status(&self) -> Arc<EncoderStatus> {
        self.status.clone()
    }

    pub fn stream_config(&self) -> &StreamConfig {
        &self.config
    }

    /// Codec configuration of the active encoder, once it has reported it.
    pub fn config(&self) -> Option<CodecConfig> {
        self.state.codec_config.clone()
    }

    /// Settings the active encoder was configured with.
    pub fn settings(&self) -> Option<&EncoderSettings> {
        self.state.settings.as_ref()
    }

    pub fn fps(&self) -> u32 {
        self.state.fps
    }

    /// Offer one frame to the encoder. Returns `false` if it was dropped.
    ///
    /// (Re)creates the encoder first when none is active or the frame size
    /// differs from the active configuration. Never blocks for longer than
    /// the configured input timeout.
    pub fn submit_frame(&mut self, frame: &RawFrame) -> bool {
        if let Err(e) = frame.validate() {
            tracing::warn!(error = %e, "rejecting malformed frame");
            self.status.record_drop();
            return false;
        }

        let size_changed = self
            .state
            .settings
            .as_ref()
            .is_some_and(|s| (s.width, s.height) != (frame.width, frame.height));
        if self.encoder.is_none() || size_changed {
            if self.in_cooldown() {
                self.status.record_drop();
                return false;
            }
            if size_changed {
                // A new resolution gets its own default bitrate.
                self.state.bitrate_override = None;
            }
            if self.start_encoder(frame.width, frame.height).is_err() {
                self.status.record_drop();
                return false;
            }
        }

        let Some(color_format) = self.state.settings.as_ref().map(|s| s.color_format) else {
            self.status.record_drop();
            return false;
        };

        let frame_index = self.state.frame_counter;
        self.state.frame_counter += 1;
        let pending = PendingFrame {
            pts_us: self.state.pts_for(frame_index),
            frame_index,
            clock_90k: self.state.clock_for(frame_index),
        };

        if let Err(e) = convert::convert_into(frame, color_format, &mut self.scratch) {
            tracing::warn!(error = %e, frame_index, "frame conversion failed");
            self.status.record_drop();
            return false;
        }

        let Some(encoder) = self.encoder.as_mut() else {
            self.status.record_drop();
            return false;
        };
        match encoder.queue_input(&self.scratch, pending.pts_us, self.config.input_timeout) {
            Ok(true) => {
                self.state.pending.push_back(pending);
                true
            }
            Ok(false) => {
                let dropped = self.status.record_drop();
                if dropped % 100 == 1 {
                    tracing::warn!(dropped, frame_index, "encoder input full, dropping frames");
                }
                false
            }
            Err(e) => {
                tracing::error!(error = %e, frame_index, "encoder rejected input");
                self.status.record_error(e.to_string());
                self.status.record_drop();
                self.teardown();
                self.state.last_failure = Some(Instant::now());
                false
            }
        }
    }

    /// Pull encoded samples, in submission order.
    pub fn drain(&mut self) -> Vec<EncodedSample> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::Sample(sample) => {
                    Some(Arc::try_unwrap(sample).unwrap_or_else(|s| (*s).clone()))
                }
                StreamEvent::Format(_) => None,
            })
            .collect()
    }

    /// Pull encoder output as stream events: a `Format` event whenever a
    /// new codec configuration is captured, followed by that epoch's
    /// samples.
    ///
    /// At most `max_drain_iterations` encoder outputs are consumed per call.
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let Some(encoder) = self.encoder.as_mut() else {
            return events;
        };

        for _ in 0..self.config.max_drain_iterations.max(1) {
            let Some(output) = encoder.drain_next() else {
                break;
            };
            match output {
                EncoderOutput::FormatChanged { config_buffers } => {
                    match CodecConfig::from_config_buffers(&config_buffers) {
                        Some(config) => {
                            events.push(StreamEvent::Format(Self::capture_config(
                                &mut self.state,
                                &self.status,
                                config,
                            )));
                        }
                        None => {
                            tracing::warn!(
                                buffers = config_buffers.len(),
                                "format change without SPS"
                            );
                        }
                    }
                }
                EncoderOutput::Data {
                    payload,
                    key_frame,
                    pts_us,
                } => {
                    if self.state.codec_config.is_none()
                        && key_frame
                        && let Some(config) = CodecConfig::from_config_buffers(&[&payload])
                    {
                        events.push(StreamEvent::Format(Self::capture_config(
                            &mut self.state,
                            &self.status,
                            config,
                        )));
                    }

                    let (frame_index, clock_90k) = Self::match_pending(&mut self.state, pts_us);
                    let sample = EncodedSample {
                        data: payload,
                        key_frame,
                        pts_us,
                        frame_index,
                        clock_90k,
                        epoch: self.state.epoch,
                    };
                    self.status.frames_encoded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        frame_index,
                        key_frame,
                        size = sample.data.len(),
                        "encoded sample drained"
                    );
                    events.push(StreamEvent::Sample(Arc::new(sample)));
                }
            }
        }
        events
    }

    /// Tear down and recreate the encoder with new parameters. Sessions and
    /// their SSRCs are unaffected; the frame counter keeps running.
    pub fn reconfigure(
        &mut self,
        width: u32,
        height: u32,
        bitrate: u32,
        mode: BitrateMode,
    ) -> Result<()> {
        self.state.bitrate_override = Some(bitrate);
        self.state.bitrate_mode = mode;
        self.start_encoder(width, height)
    }

    /// Change only the bitrate, keeping size and mode.
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        self.state.bitrate_override = Some(bitrate);
        self.restart()
    }

    pub fn set_bitrate_mode(&mut self, mode: BitrateMode) -> Result<()> {
        self.state.bitrate_mode = mode;
        self.restart()
    }

    /// Change the nominal frame rate.
    ///
    /// The timebase is re-anchored at the next frame so presentation and
    /// RTP timestamps continue monotonically at the new spacing.
    pub fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        let fps = fps.max(1);
        if fps == self.state.fps {
            return Ok(());
        }
        let next = self.state.frame_counter;
        self.state.timebase = Timebase {
            first_index: next,
            pts_us: self.state.pts_for(next),
            clock_90k: self.state.clock_for(next),
        };
        tracing::info!(from = self.state.fps, to = fps, frame_index = next, "frame rate changed");
        self.state.fps = fps;
        self.restart()
    }

    /// Apply an external pressure signal as a bitrate / mode change.
    pub fn apply_pressure(&mut self, pressure: PressureState) -> Result<()> {
        if pressure == self.state.pressure {
            return Ok(());
        }
        tracing::info!(from = ?self.state.pressure, to = ?pressure, "encoder pressure changed");
        self.state.pressure = pressure;
        self.restart()
    }

    /// Whether an encoder carrying a published format was stopped since
    /// the last call. Consumers must stop advertising that format until
    /// the next `Format` event.
    pub fn take_format_retired(&mut self) -> bool {
        std::mem::take(&mut self.format_retired)
    }

    /// Stop the active encoder, if any.
    pub fn shutdown(&mut self) {
        self.teardown();
    }

    /// Recreate the encoder at the current size. A no-op before the first
    /// frame has fixed the size.
    fn restart(&mut self) -> Result<()> {
        match self.state.settings.as_ref().map(|s| (s.width, s.height)) {
            Some((width, height)) => self.start_encoder(width, height),
            None => Ok(()),
        }
    }

    fn in_cooldown(&self) -> bool {
        self.state
            .last_failure
            .is_some_and(|at| at.elapsed() < self.config.reconfigure_cooldown)
    }

    fn teardown(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            tracing::debug!(encoder = encoder.name(), "stopping encoder");
            encoder.stop();
        }
        self.state.settings = None;
        if self.state.codec_config.take().is_some() {
            self.format_retired = true;
        }
        self.state.pending.clear();
        self.status.clear_encoder();
    }

    /// Fully stop any existing encoder, then create and configure a new one.
    fn start_encoder(&mut self, width: u32, height: u32) -> Result<()> {
        self.teardown();
        match self.create_encoder(width, height) {
            Ok((encoder, settings)) => {
                self.state.epoch = self.state.epoch.wrapping_add(1);
                self.state.last_failure = None;
                *self.status.name.write() = Some(encoder.name().to_string());
                *self.status.color_format.write() = Some(settings.color_format);
                self.status
                    .hardware
                    .store(encoder.is_hardware(), Ordering::Relaxed);
                self.status.reconfigurations.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    encoder = encoder.name(),
                    hardware = encoder.is_hardware(),
                    width,
                    height,
                    fps = settings.fps,
                    bitrate = settings.bitrate,
                    mode = ?settings.bitrate_mode,
                    color_format = settings.color_format.name(),
                    epoch = self.state.epoch,
                    "encoder configured"
                );
                self.encoder = Some(encoder);
                self.state.settings = Some(settings);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, width, height, "encoder configuration failed");
                self.status.record_error(e.to_string());
                self.state.last_failure = Some(Instant::now());
                Err(e)
            }
        }
    }

    fn create_encoder(
        &self,
        width: u32,
        height: u32,
    ) -> Result<(Box<dyn Encoder>, EncoderSettings)> {
        let mut encoder = self.factory.create()?;
        let Some(color_format) = choose_color_format(
            encoder.preferred_color_format(),
            encoder.supported_color_formats(),
        ) else {
            encoder.stop();
            return Err(StreamError::EncoderConfigure(format!(
                "{} offers no input color format",
                encoder.name()
            )));
        };

        let pressure = self.state.pressure;
        let target = self
            .state
            .bitrate_override
            .unwrap_or_else(|| self.config.bitrate_for(width, height));
        let settings = EncoderSettings {
            width,
            height,
            bitrate: (target as u64 * pressure.bitrate_percent() as u64 / 100) as u32,
            bitrate_mode: pressure.mode_override().unwrap_or(self.state.bitrate_mode),
            fps: self.state.fps,
            keyframe_interval_secs: self.config.keyframe_interval_secs,
            color_format,
        };

        if let Err(e) = encoder.configure(&settings) {
            encoder.stop();
            return Err(e);
        }
        Ok((encoder, settings))
    }

    fn capture_config(
        state: &mut RuntimeState,
        status: &EncoderStatus,
        config: CodecConfig,
    ) -> Arc<StreamFormat> {
        let (width, height) = state
            .settings
            .as_ref()
            .map_or((0, 0), |s| (s.width, s.height));
        let format = Arc::new(StreamFormat {
            config: config.clone(),
            width,
            height,
            fps: state.fps,
            epoch: state.epoch,
        });
        tracing::info!(
            profile_level_id = %config.profile_level_id(),
            sps_len = config.sps.len(),
            has_pps = config.pps.is_some(),
            epoch = state.epoch,
            "codec configuration captured"
        );
        state.codec_config = Some(config);
        *status.format.write() = Some(format.clone());
        format
    }

    /// Map an output's presentation time back to its source frame.
    fn match_pending(state: &mut RuntimeState, pts_us: u64) -> (u64, u64) {
        // Entries older than this output were dropped inside the encoder.
        while state.pending.front().is_some_and(|p| p.pts_us < pts_us) {
            state.pending.pop_front();
        }
        if let Some(p) = state.pending.front().copied()
            && p.pts_us == pts_us
        {
            state.pending.pop_front();
            return (p.frame_index, p.clock_90k);
        }
        let index = state.index_for(pts_us);
        (index, state.clock_for(index))
    }
}

impl Drop for EncoderOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}
