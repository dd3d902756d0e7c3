//! The single encode loop and the bus it publishes to.
//!
//! ```text
//! FrameSource ─▶ EncoderOrchestrator ─▶ SampleBus ─┬─▶ RTSP session queue (one per session)
//!      ▲                                           └─▶ fMP4 HTTP queue (one per connection)
//!      └── ControlCommand channel
//! ```
//!
//! Frames are submitted and drained on one thread so sample order always
//! matches submission order. Every subscriber gets its own bounded queue;
//! a full queue sheds the event for that subscriber only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::BitrateMode;
use crate::encoder::{EncoderOrchestrator, EncoderStatus, PressureState};
use crate::error::Result;
use crate::media::{StreamEvent, StreamFormat};
use crate::source::FrameSource;

/// Runtime control input for the encode loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    SetBitrate(u32),
    SetBitrateMode(BitrateMode),
    SetFrameRate(u32),
    SetResolution { width: u32, height: u32 },
    Pressure(PressureState),
    /// Drop the active encoder; the next frame creates a fresh one.
    ResetEncoder,
}

struct Subscriber {
    id: u64,
    name: String,
    tx: SyncSender<StreamEvent>,
    dropped: u64,
}

/// Broadcasts stream events to independent bounded queues.
#[derive(Default)]
pub struct SampleBus {
    subscribers: Mutex<Vec<Subscriber>>,
    latest: RwLock<Option<Arc<StreamFormat>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl SampleBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a queue of `capacity` events. The current
    /// format, if any, is queued first.
    pub fn subscribe(&self, name: &str, capacity: usize) -> Receiver<StreamEvent> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        if let Some(format) = self.latest_format() {
            let _ = tx.try_send(StreamEvent::Format(format));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        subscribers.push(Subscriber {
            id,
            name: name.to_string(),
            tx,
            dropped: 0,
        });
        tracing::debug!(subscriber = name, id, total = subscribers.len(), "bus subscriber added");
        rx
    }

    /// Deliver `event` to every subscriber without blocking. Subscribers
    /// whose receiver is gone are removed.
    pub fn publish(&self, event: StreamEvent) {
        if let StreamEvent::Format(format) = &event {
            *self.latest.write() = Some(format.clone());
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.dropped += 1;
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if sub.dropped % 100 == 1 {
                    tracing::warn!(
                        subscriber = %sub.name,
                        id = sub.id,
                        dropped = sub.dropped,
                        total,
                        "subscriber queue full, dropping events"
                    );
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!(subscriber = %sub.name, id = sub.id, "bus subscriber gone");
                false
            }
        });
    }

    /// Forget the current format. Until the next `Format` event, new
    /// subscribers get no format and [`wait_for_format`](Self::wait_for_format)
    /// waits.
    pub fn retire_format(&self) {
        if let Some(format) = self.latest.write().take() {
            tracing::debug!(epoch = format.epoch, "stream format retired");
        }
    }

    pub fn latest_format(&self) -> Option<Arc<StreamFormat>> {
        self.latest.read().clone()
    }

    /// Poll for a known format for at most `timeout`.
    pub fn wait_for_format(&self, timeout: Duration, poll: Duration) -> Option<Arc<StreamFormat>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(format) = self.latest_format() {
                return Some(format);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events shed across all subscribers because their queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Time of the most recent frame the encode loop handled, for the
/// watchdog.
#[derive(Debug)]
pub struct Liveness {
    origin: Instant,
    last_ms: AtomicU64,
    beats: AtomicU64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            beats: AtomicU64::new(0),
        }
    }
}

impl Liveness {
    pub fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the last [`touch`](Self::touch), or since creation if
    /// there was none.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

/// Handle to the running encode loop.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    control: Sender<ControlCommand>,
    status: Arc<EncoderStatus>,
    liveness: Arc<Liveness>,
    handle: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start the encode loop on its own thread, pacing frames at the
    /// orchestrator's nominal frame rate.
    pub fn spawn(
        orchestrator: EncoderOrchestrator,
        source: Box<dyn FrameSource>,
        bus: Arc<SampleBus>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (control, commands) = mpsc::channel();
        let status = orchestrator.status();
        let liveness = Arc::new(Liveness::default());

        let encode_loop = EncodeLoop {
            orchestrator,
            source,
            bus,
            commands,
            running: running.clone(),
            liveness: liveness.clone(),
        };
        let handle = thread::Builder::new()
            .name("encode-loop".into())
            .spawn(move || encode_loop.run())?;

        Ok(Self {
            running,
            control,
            status,
            liveness,
            handle: Some(handle),
        })
    }

    /// Queue a control command. Returns `false` once the loop has exited.
    pub fn control(&self, command: ControlCommand) -> bool {
        self.control.send(command).is_ok()
    }

    pub fn controller(&self) -> Sender<ControlCommand> {
        self.control.clone()
    }

    pub fn status(&self) -> Arc<EncoderStatus> {
        self.status.clone()
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        self.liveness.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the loop to stop and wait for it to release the encoder.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("encode loop panicked");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EncodeLoop {
    orchestrator: EncoderOrchestrator,
    source: Box<dyn FrameSource>,
    bus: Arc<SampleBus>,
    commands: Receiver<ControlCommand>,
    running: Arc<AtomicBool>,
    liveness: Arc<Liveness>,
}

impl EncodeLoop {
    fn run(mut self) {
        tracing::info!(fps = self.orchestrator.fps(), "encode loop started");
        let mut next_tick = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            self.step();

            let interval = Duration::from_micros(1_000_000 / self.orchestrator.fps().max(1) as u64);
            next_tick += interval;
            let now = Instant::now();
            match next_tick.checked_duration_since(now) {
                Some(wait) => thread::sleep(wait),
                // Behind schedule: don't try to catch up with a burst.
                None => next_tick = now,
            }
        }

        self.orchestrator.shutdown();
        self.bus.retire_format();
        tracing::info!("encode loop stopped");
    }

    /// Apply pending commands, submit one frame and publish what the
    /// encoder produced.
    fn step(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }

        if let Some(frame) = self.source.next_frame() {
            self.orchestrator.submit_frame(&frame);
            self.liveness.touch();
        }
        if self.orchestrator.take_format_retired() {
            self.bus.retire_format();
        }
        for event in self.orchestrator.drain_events() {
            self.bus.publish(event);
        }
    }

    fn apply(&mut self, command: ControlCommand) {
        tracing::debug!(?command, "control command");
        let result = match command {
            ControlCommand::SetBitrate(bitrate) => self.orchestrator.set_bitrate(bitrate),
            ControlCommand::SetBitrateMode(mode) => self.orchestrator.set_bitrate_mode(mode),
            ControlCommand::SetFrameRate(fps) => self.orchestrator.set_frame_rate(fps),
            ControlCommand::Pressure(pressure) => self.orchestrator.apply_pressure(pressure),
            ControlCommand::SetResolution { width, height } => {
                if !self.source.set_resolution(width, height) {
                    tracing::warn!(width, height, "frame source cannot change resolution");
                }
                Ok(())
            }
            ControlCommand::ResetEncoder => {
                self.orchestrator.shutdown();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "control command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::encoder::stub::StubEncoderFactory;
    use crate::media::{CodecConfig, EncodedSample};
    use crate::source::TestPatternSource;

    fn format(epoch: u32) -> StreamEvent {
        StreamEvent::Format(Arc::new(StreamFormat {
            config: CodecConfig {
                sps: vec![0x67, 0x42, 0xc0, 0x1f],
                pps: None,
            },
            width: 64,
            height: 48,
            fps: 30,
            epoch,
        }))
    }

    fn sample(index: u64) -> StreamEvent {
        StreamEvent::Sample(Arc::new(EncodedSample {
            data: vec![0, 0, 0, 1, 0x41, 1],
            key_frame: false,
            pts_us: 0,
            frame_index: index,
            clock_90k: 0,
            epoch: 1,
        }))
    }

    #[test]
    fn late_subscriber_gets_latest_format_first() {
        let bus = SampleBus::new();
        bus.publish(format(1));
        bus.publish(format(2));
        let rx = bus.subscribe("late", 4);
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Format(f)) if f.epoch == 2));
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let bus = SampleBus::new();
        let slow = bus.subscribe("slow", 1);
        let fast = bus.subscribe("fast", 8);
        for i in 0..3 {
            bus.publish(sample(i));
        }
        assert_eq!(fast.try_iter().count(), 3);
        assert_eq!(slow.try_iter().count(), 1);
        assert_eq!(bus.dropped(), 2);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = SampleBus::new();
        let rx = bus.subscribe("gone", 1);
        drop(rx);
        bus.publish(sample(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn wait_for_format_times_out() {
        let bus = SampleBus::new();
        let start = Instant::now();
        assert!(
            bus.wait_for_format(Duration::from_millis(50), Duration::from_millis(10))
                .is_none()
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        bus.publish(format(1));
        assert!(bus.wait_for_format(Duration::ZERO, Duration::ZERO).is_some());
    }

    #[test]
    fn resolution_change_retires_the_published_format() {
        let factory = StubEncoderFactory::new();
        let failing = factory.failure_switch();
        let config = StreamConfig {
            reconfigure_cooldown: Duration::ZERO,
            ..StreamConfig::default()
        };
        let bus = Arc::new(SampleBus::new());
        let (control, commands) = mpsc::channel();
        let mut encode_loop = EncodeLoop {
            orchestrator: EncoderOrchestrator::new(config, Box::new(factory)),
            source: Box::new(TestPatternSource::new(64, 48, 30)),
            bus: bus.clone(),
            commands,
            running: Arc::new(AtomicBool::new(true)),
            liveness: Arc::new(Liveness::default()),
        };

        encode_loop.step();
        let first = bus.latest_format().unwrap();
        assert_eq!((first.width, first.height), (64, 48));

        // The new encoder cannot start, so no format exists for 128x96.
        failing.store(true, Ordering::Relaxed);
        control
            .send(ControlCommand::SetResolution {
                width: 128,
                height: 96,
            })
            .unwrap();
        encode_loop.step();
        assert!(bus.latest_format().is_none());
        assert!(
            bus.wait_for_format(Duration::from_millis(30), Duration::from_millis(10))
                .is_none()
        );
        let late = bus.subscribe("late", 4);
        assert!(late.try_recv().is_err(), "stale format handed to a new subscriber");

        failing.store(false, Ordering::Relaxed);
        encode_loop.step();
        let current = bus
            .wait_for_format(Duration::ZERO, Duration::ZERO)
            .unwrap();
        assert_eq!((current.width, current.height), (128, 96));
        assert!(current.epoch > first.epoch);
    }

    #[test]
    fn pipeline_publishes_format_then_samples() {
        let bus = Arc::new(SampleBus::new());
        let rx = bus.subscribe("test", 256);
        let config = StreamConfig {
            fps: 100,
            ..StreamConfig::default()
        };
        let orchestrator =
            EncoderOrchestrator::new(config, Box::new(StubEncoderFactory::new()));
        let source = TestPatternSource::new(64, 48, 100);
        let mut pipeline = Pipeline::spawn(orchestrator, Box::new(source), bus.clone()).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, StreamEvent::Format(_)));
        let mut last_index = None;
        for _ in 0..5 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                StreamEvent::Sample(s) => {
                    if let Some(prev) = last_index {
                        assert!(s.frame_index > prev);
                    }
                    last_index = Some(s.frame_index);
                }
                StreamEvent::Format(_) => panic!("unexpected second format"),
            }
        }
        assert!(pipeline.liveness().beats() >= 5);

        assert!(pipeline.control(ControlCommand::SetResolution {
            width: 128,
            height: 96
        }));
        let reconfigured = rx
            .iter()
            .take(50)
            .find_map(|event| match event {
                StreamEvent::Format(f) => Some(f),
                StreamEvent::Sample(_) => None,
            })
            .unwrap();
        assert_eq!((reconfigured.width, reconfigured.height), (128, 96));

        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(!pipeline.status().encoder_present());
    }
}
