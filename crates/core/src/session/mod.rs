//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! Every RTSP control connection owns exactly one session, created when the
//! client connects. It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state.
//! - The transport negotiated during SETUP and the delivery worker that
//!   feeds it.
//! - A packetizer with its own random SSRC and sequence counter.
//!
//! ## Session lifecycle
//!
//! ```text
//! connect        -> Init
//! SETUP          -> Ready
//! PLAY           -> Playing   (from Ready)
//! PAUSE          -> Ready     (from Playing; transport kept)
//! TEARDOWN       -> Terminated (transport released, session removed)
//! TCP disconnect -> Terminated (via cleanup)
//! ```

pub mod admission;
pub mod delivery;
mod registry;
pub mod transport;
pub mod watchdog;

use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StreamError};
use crate::media::Packetizer;
pub use admission::{Admission, AdmissionPool, Permit};
pub use delivery::{DeliveryHandle, SessionSink};
pub use registry::{HttpConnectionGuard, HttpConnectionInfo, HttpConnections};
pub use transport::{Transport, TransportHeader};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no transport yet.
    Init,
    /// Transport set up, not delivering.
    Ready,
    /// Samples are delivered to the transport.
    Playing,
    /// Torn down; terminal.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Playing => "PLAYING",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Delivery counters for one session.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    samples: AtomicU64,
    skipped: AtomicU64,
    send_errors: AtomicU64,
}

impl DeliveryStats {
    fn record_sent(&self, packets: usize, bytes: usize) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_error(&self) -> u64 {
        self.send_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Delta frames discarded while waiting for the first keyframe.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// A single RTSP session (RFC 2326 §3).
///
/// Interior mutability allows shared references across the control
/// connection thread and the delivery worker.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Address of the client's control connection.
    pub peer: SocketAddr,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    state: RwLock<SessionState>,
    transport: RwLock<Option<Transport>>,
    packetizer: Mutex<Box<dyn Packetizer>>,
    awaiting_keyframe: AtomicBool,
    delivery: Mutex<Option<DeliveryHandle>>,
    control: Mutex<Option<TcpStream>>,
    stats: DeliveryStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("transport", &self.transport())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in [`SessionState::Init`] with a unique ID.
    pub fn new(peer: SocketAddr, packetizer: Box<dyn Packetizer>) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Session {
            id: format!("{:016X}", id),
            peer,
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            state: RwLock::new(SessionState::Init),
            transport: RwLock::new(None),
            packetizer: Mutex::new(packetizer),
            awaiting_keyframe: AtomicBool::new(true),
            delivery: Mutex::new(None),
            control: Mutex::new(None),
            stats: DeliveryStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    pub fn transport(&self) -> Option<Transport> {
        *self.transport.read()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn ssrc(&self) -> u32 {
        self.packetizer.lock().ssrc()
    }

    /// `(next sequence number, current RTP timestamp)` for `RTP-Info`.
    pub fn rtp_position(&self) -> (u16, u32) {
        let packetizer = self.packetizer.lock();
        (packetizer.next_sequence(), packetizer.next_rtp_timestamp())
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    /// Keep a handle to the control connection so the server can close it
    /// on shutdown.
    pub fn attach_control(&self, stream: TcpStream) {
        *self.control.lock() = Some(stream);
    }

    /// Whether SETUP is allowed in the current state.
    pub fn can_setup(&self) -> Result<()> {
        match self.state() {
            SessionState::Init | SessionState::Ready => Ok(()),
            state => Err(self.invalid("SETUP", state)),
        }
    }

    /// Install a negotiated transport: INIT/READY -> READY. A previous
    /// transport's worker is stopped first.
    pub fn setup(&self, transport: Transport, delivery: DeliveryHandle) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            SessionState::Init | SessionState::Ready => {}
            other => return Err(self.invalid("SETUP", other)),
        }
        let previous = self.delivery.lock().replace(delivery);
        *self.transport.write() = Some(transport);
        tracing::debug!(session_id = %self.id, old_state = %*state, new_state = %SessionState::Ready, transport = transport.kind(), "state transition");
        *state = SessionState::Ready;
        drop(state);
        if let Some(mut previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// READY -> PLAYING. Returns `false` if the session was already
    /// playing (no transition).
    pub fn play(&self) -> Result<bool> {
        let mut state = self.state.write();
        match *state {
            SessionState::Ready => {
                self.awaiting_keyframe.store(true, Ordering::SeqCst);
                *state = SessionState::Playing;
                tracing::debug!(session_id = %self.id, old_state = %SessionState::Ready, new_state = %SessionState::Playing, "state transition");
                Ok(true)
            }
            SessionState::Playing => Ok(false),
            other => Err(self.invalid("PLAY", other)),
        }
    }

    /// PLAYING -> READY, keeping the transport. A no-op when already READY.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.write();
        match *state {
            SessionState::Playing => {
                *state = SessionState::Ready;
                tracing::debug!(session_id = %self.id, old_state = %SessionState::Playing, new_state = %SessionState::Ready, "state transition");
                Ok(())
            }
            SessionState::Ready => Ok(()),
            other => Err(self.invalid("PAUSE", other)),
        }
    }

    /// Move to TERMINATED and release the transport. Returns `false` if the
    /// session was already terminated.
    pub fn terminate(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Terminated {
                return false;
            }
            tracing::debug!(session_id = %self.id, old_state = %*state, new_state = %SessionState::Terminated, "state transition");
            *state = SessionState::Terminated;
        }
        let delivery = self.delivery.lock().take();
        if let Some(mut delivery) = delivery {
            delivery.stop();
        }
        self.transport.write().take();
        true
    }

    /// Shut the control connection down, unblocking its reader.
    pub fn close_control(&self) {
        if let Some(stream) = self.control.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn invalid(&self, method: &str, state: SessionState) -> StreamError {
        StreamError::InvalidState {
            method: method.to_string(),
            state: state.to_string(),
        }
    }
}

/// Thread-safe registry of live sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads. Fan-out
/// iterates a snapshot, so inserts and removals never wait on delivery.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a new control connection and register it.
    pub fn create_session(&self, peer: SocketAddr, packetizer: Box<dyn Packetizer>) -> Arc<Session> {
        let session = Arc::new(Session::new(peer, packetizer));
        let id = session.id.clone();
        let mut sessions = self.sessions.write();
        sessions.insert(id.clone(), session.clone());
        tracing::debug!(session_id = %id, %peer, total_sessions = sessions.len(), "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn playing_count(&self) -> usize {
        self.sessions.read().values().filter(|s| s.is_playing()).count()
    }

    /// Terminate and remove every session, closing their control
    /// connections.
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close_control();
            session.terminate();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::h264::H264Packetizer;
    use crate::pipeline::SampleBus;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            "127.0.0.1:50000".parse().unwrap(),
            Box::new(H264Packetizer::new(96, 0x1234)),
        ))
    }

    fn interleaved() -> Transport {
        Transport::Interleaved {
            rtp_channel: 0,
            rtcp_channel: 1,
        }
    }

    fn delivery(session: &Arc<Session>) -> DeliveryHandle {
        let bus = Arc::new(SampleBus::new());
        let rx = bus.subscribe("test", 4);
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = crate::transport::UdpTransport::bind(
            "127.0.0.1".parse().unwrap(),
            client.local_addr().unwrap(),
        )
        .unwrap();
        DeliveryHandle::spawn(session.clone(), SessionSink::Udp(sink), rx, bus).unwrap()
    }

    #[test]
    fn play_before_setup_is_invalid() {
        let s = session();
        assert!(matches!(s.play(), Err(StreamError::InvalidState { .. })));
        assert_eq!(s.state(), SessionState::Init);
    }

    #[test]
    fn full_lifecycle() {
        let s = session();
        s.setup(interleaved(), delivery(&s)).unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert!(s.play().unwrap());
        assert!(!s.play().unwrap(), "PLAYING -> PLAYING is not a transition");
        s.pause().unwrap();
        assert_eq!(s.state(), SessionState::Ready);
        assert!(s.transport().is_some(), "PAUSE keeps the transport");
        assert!(s.terminate());
        assert!(!s.terminate());
        assert!(s.transport().is_none());
        assert!(s.setup(interleaved(), delivery(&s)).is_err());
    }

    #[test]
    fn setup_while_playing_is_invalid() {
        let s = session();
        s.setup(interleaved(), delivery(&s)).unwrap();
        s.play().unwrap();
        assert!(s.can_setup().is_err());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = session();
        let b = session();
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
        assert_eq!(a.session_header_value(), format!("{};timeout=60", a.id));
    }

    #[test]
    fn manager_counts() {
        let manager = SessionManager::new();
        let peer = "127.0.0.1:1".parse().unwrap();
        let a = manager.create_session(peer, Box::new(H264Packetizer::new(96, 1)));
        let _b = manager.create_session(peer, Box::new(H264Packetizer::new(96, 2)));
        a.setup(interleaved(), delivery(&a)).unwrap();
        a.play().unwrap();
        assert_eq!(manager.active_count(), 2);
        assert_eq!(manager.playing_count(), 1);
        assert_eq!(manager.playing_sessions()[0].id, a.id);
        assert!(manager.remove_session(&a.id).is_some());
        assert!(manager.remove_session(&a.id).is_none());
        assert_eq!(manager.terminate_all(), 1);
        assert_eq!(manager.active_count(), 0);
    }
}
