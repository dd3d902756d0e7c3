//! Per-session RTP delivery.
//!
//! Each session that completed SETUP owns one delivery worker: a thread
//! that drains the session's bounded bus queue, packetizes samples with the
//! session's own packetizer and writes them to the session's transport. A
//! slow or broken client only ever fills its own queue.

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::Session;
use crate::error::Result;
use crate::media::{EncodedSample, StreamEvent};
use crate::pipeline::SampleBus;
use crate::transport::UdpTransport;
use crate::transport::tcp::interleave_frame;

/// Write half of an RTSP control connection, shared between the request
/// loop and interleaved RTP delivery so frames never interleave mid-write.
pub type SharedWriter = Arc<Mutex<TcpStream>>;

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Where a session's packets go.
#[derive(Debug)]
pub enum SessionSink {
    Udp(UdpTransport),
    Interleaved { writer: SharedWriter, channel: u8 },
}

impl SessionSink {
    /// Send one access unit's packets. Returns the bytes written.
    fn send_all(&self, packets: &[Vec<u8>]) -> io::Result<usize> {
        match self {
            Self::Udp(udp) => {
                let mut sent = 0;
                for packet in packets {
                    sent += udp.send_rtp(packet)?;
                }
                Ok(sent)
            }
            Self::Interleaved { writer, channel } => {
                let framed: Vec<u8> = packets
                    .iter()
                    .flat_map(|p| interleave_frame(*channel, p))
                    .collect();
                let mut stream = writer.lock();
                stream.write_all(&framed)?;
                stream.flush()?;
                Ok(framed.len())
            }
        }
    }

    /// Whether a failed send leaves the transport unusable. A partial
    /// interleaved write desynchronizes the client's `$` framing.
    fn is_fatal(&self) -> bool {
        matches!(self, Self::Interleaved { .. })
    }

    fn close(&self) {
        if let Self::Interleaved { writer, .. } = self {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
    }
}

/// Owner of a delivery worker thread. Stopping (or dropping) it joins the
/// worker, which releases the transport sockets.
#[derive(Debug)]
pub struct DeliveryHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeliveryHandle {
    pub fn spawn(
        session: Arc<Session>,
        sink: SessionSink,
        events: Receiver<StreamEvent>,
        bus: Arc<SampleBus>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            session,
            sink,
            events,
            bus,
            stop: stop.clone(),
            epoch: None,
        };
        let name = format!("rtp-{}", worker.session.id);
        let thread = thread::Builder::new().name(name).spawn(move || worker.run())?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("delivery worker panicked");
        }
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    session: Arc<Session>,
    sink: SessionSink,
    events: Receiver<StreamEvent>,
    bus: Arc<SampleBus>,
    stop: Arc<AtomicBool>,
    epoch: Option<u32>,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!(session_id = %self.session.id, "delivery worker started");
        while !self.stop.load(Ordering::SeqCst) {
            match self.events.recv_timeout(WORKER_POLL) {
                Ok(StreamEvent::Format(format)) => {
                    self.session.packetizer.lock().update_format(&format);
                    self.epoch = Some(format.epoch);
                }
                Ok(StreamEvent::Sample(sample)) => {
                    if !self.deliver(&sample) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(session_id = %self.session.id, "delivery worker stopped");
    }

    /// Returns `false` once the transport is unusable.
    fn deliver(&mut self, sample: &EncodedSample) -> bool {
        let session = &self.session;
        if !session.is_playing() {
            return true;
        }

        // The format event may have been shed from a full queue.
        if self.epoch != Some(sample.epoch)
            && let Some(format) = self.bus.latest_format()
            && format.epoch == sample.epoch
        {
            session.packetizer.lock().update_format(&format);
            self.epoch = Some(format.epoch);
        }

        if session.awaiting_keyframe.load(Ordering::SeqCst) {
            if !sample.key_frame {
                session.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            session.awaiting_keyframe.store(false, Ordering::SeqCst);
            tracing::debug!(session_id = %session.id, frame_index = sample.frame_index, "first keyframe, delivery starts");
        }

        let packets = session.packetizer.lock().packetize_sample(sample);
        match self.sink.send_all(&packets) {
            Ok(bytes) => session.stats.record_sent(packets.len(), bytes),
            Err(e) if self.sink.is_fatal() => {
                session.stats.record_error();
                tracing::warn!(session_id = %session.id, error = %e, "interleaved write failed, closing connection");
                session.close_control();
                self.sink.close();
                return false;
            }
            Err(e) => {
                let errors = session.stats.record_error();
                if errors % 100 == 1 {
                    tracing::warn!(session_id = %session.id, error = %e, errors, "RTP send failed");
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;
    use crate::media::rtp::ParsedHeader;
    use crate::media::{CodecConfig, StreamFormat};
    use crate::session::Transport;
    use std::io::Read;
    use std::net::UdpSocket;

    fn sample(index: u64, key_frame: bool) -> StreamEvent {
        let header = if key_frame { 0x65 } else { 0x41 };
        StreamEvent::Sample(Arc::new(EncodedSample {
            data: vec![0, 0, 0, 1, header, 0x88, 0x84],
            key_frame,
            pts_us: 0,
            frame_index: index,
            clock_90k: index * 3000,
            epoch: 1,
        }))
    }

    fn format() -> StreamEvent {
        StreamEvent::Format(Arc::new(StreamFormat {
            config: CodecConfig {
                sps: vec![0x67, 0x42, 0xc0, 0x1f],
                pps: Some(vec![0x68, 0xce, 0x3c, 0x80]),
            },
            width: 64,
            height: 48,
            fps: 30,
            epoch: 1,
        }))
    }

    #[test]
    fn playing_session_skips_to_first_keyframe() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let udp =
            UdpTransport::bind("127.0.0.1".parse().unwrap(), client.local_addr().unwrap()).unwrap();
        let session = Arc::new(Session::new(
            "127.0.0.1:1".parse().unwrap(),
            Box::new(H264Packetizer::new(96, 0xfeed)),
        ));
        let bus = Arc::new(SampleBus::new());
        let rx = bus.subscribe("test", 16);
        let handle =
            DeliveryHandle::spawn(session.clone(), SessionSink::Udp(udp), rx, bus.clone()).unwrap();
        session
            .setup(
                Transport::Interleaved {
                    rtp_channel: 0,
                    rtcp_channel: 1,
                },
                handle,
            )
            .unwrap();

        session.play().unwrap();
        bus.publish(format());
        bus.publish(sample(1, false));
        bus.publish(sample(2, true));

        // SPS, PPS, IDR: the cached parameter sets lead the keyframe.
        let mut buf = [0u8; 1500];
        let mut first_types = Vec::new();
        for _ in 0..3 {
            let n = client.recv(&mut buf).unwrap();
            let header = ParsedHeader::parse(&buf[..n]).unwrap();
            assert_eq!(header.ssrc, 0xfeed);
            assert_eq!(header.timestamp, 6000);
            first_types.push(buf[12] & 0x1f);
        }
        assert_eq!(first_types, [7, 8, 5]);
        assert_eq!(session.stats().skipped(), 1);

        assert!(session.terminate());
        assert_eq!(session.stats().samples(), 1);
    }

    #[test]
    fn failed_interleaved_write_closes_the_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let mut control_reader = server.try_clone().unwrap();
        control_reader
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let session = Arc::new(Session::new(peer, Box::new(H264Packetizer::new(96, 1))));
        session.attach_control(server.try_clone().unwrap());
        // Writes fail from here on, as they do after a write timeout.
        server.shutdown(Shutdown::Write).unwrap();
        let writer: SharedWriter = Arc::new(Mutex::new(server));

        let bus = Arc::new(SampleBus::new());
        let rx = bus.subscribe("test", 16);
        let sink = SessionSink::Interleaved { writer, channel: 0 };
        let handle = DeliveryHandle::spawn(session.clone(), sink, rx, bus.clone()).unwrap();
        session
            .setup(
                Transport::Interleaved {
                    rtp_channel: 0,
                    rtcp_channel: 1,
                },
                handle,
            )
            .unwrap();
        session.play().unwrap();
        bus.publish(format());
        bus.publish(sample(1, true));

        // The client never closed, so EOF here means the server side did.
        let mut buf = [0u8; 16];
        assert_eq!(control_reader.read(&mut buf).unwrap(), 0);

        bus.publish(sample(2, true));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(session.stats().send_errors(), 1, "no writes after the failure");
        assert!(session.terminate());
    }
}
