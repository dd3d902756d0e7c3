use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{DEFAULT_PAYLOAD_TYPE, DEFAULT_RTP_PAYLOAD_BUDGET};
use crate::encoder::{EncoderSnapshot, EncoderStatus};
use crate::error::{Result, StreamError};
use crate::media::StreamEvent;
use crate::pipeline::SampleBus;
use crate::session::{AdmissionPool, HttpConnectionInfo, HttpConnections, SessionManager};
use crate::transport::tcp;

/// Default RTSP listening port.
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in the SDP `o=` line.
    /// When `None`, the host is taken from the request URI or the local
    /// address of the control connection.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Dynamic RTP payload type, shared by SDP and every packetizer.
    pub payload_type: u8,
    /// Largest RTP payload before FU-A fragmentation.
    pub rtp_payload_budget: usize,
    /// Upper bound on DESCRIBE's wait for a codec configuration.
    pub describe_timeout: Duration,
    pub describe_poll: Duration,
    /// Connections served at once, across RTSP and HTTP.
    pub max_connections: usize,
    /// Connections allowed to wait for a free slot.
    pub max_queued: usize,
    /// Events buffered per session before the bus sheds them.
    pub session_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            rtp_payload_budget: DEFAULT_RTP_PAYLOAD_BUDGET,
            describe_timeout: Duration::from_secs(15),
            describe_poll: Duration::from_millis(100),
            max_connections: 16,
            max_queued: 4,
            session_queue_depth: 64,
        }
    }
}

/// State shared by every connection thread.
pub struct ServerContext {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    pub bus: Arc<SampleBus>,
    /// Diagnostics for DESCRIBE timeouts, when an encoder is attached.
    pub encoder: Option<Arc<EncoderStatus>>,
    pub admission: Arc<AdmissionPool>,
    pub running: Arc<AtomicBool>,
}

/// RTSP server.
///
/// Owns the session registry and the accept thread. Media comes from a
/// [`SampleBus`]; every SETUP subscribes the session to it, so the server
/// never touches the encoder directly.
pub struct Server {
    bind_addr: String,
    config: ServerConfig,
    sessions: SessionManager,
    bus: Arc<SampleBus>,
    encoder: Option<Arc<EncoderStatus>>,
    admission: Option<Arc<AdmissionPool>>,
    http_connections: Arc<HttpConnections>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(bind_addr: &str, bus: Arc<SampleBus>) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            config: ServerConfig::default(),
            sessions: SessionManager::new(),
            bus,
            encoder: None,
            admission: None,
            http_connections: HttpConnections::new(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            accept_thread: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Report these encoder counters when DESCRIBE times out.
    pub fn with_encoder_status(mut self, status: Arc<EncoderStatus>) -> Self {
        self.encoder = Some(status);
        self
    }

    /// Share an admission pool with another listener.
    pub fn with_admission(mut self, pool: Arc<AdmissionPool>) -> Self {
        self.admission = Some(pool);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let context = Arc::new(ServerContext {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            bus: self.bus.clone(),
            encoder: self.encoder.clone(),
            admission: self.admission(),
            running: self.running.clone(),
        });

        tracing::info!(addr = %local_addr, "RTSP server listening");

        let handle = thread::Builder::new()
            .name("rtsp-accept".into())
            .spawn(move || tcp::accept_loop(listener, context))?;
        self.local_addr = Some(local_addr);
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stop accepting, terminate every session and close their control
    /// connections.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");
        self.admission().close();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let terminated = self.sessions.terminate_all();
        tracing::info!(terminated, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound; resolves port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(StreamError::NotStarted)
    }

    /// Hand an event to every subscribed session.
    pub fn publish(&self, event: StreamEvent) {
        self.bus.publish(event);
    }

    pub fn bus(&self) -> Arc<SampleBus> {
        self.bus.clone()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    /// The admission pool, created from the config on first use.
    pub fn admission(&mut self) -> Arc<AdmissionPool> {
        self.admission
            .get_or_insert_with(|| {
                AdmissionPool::new(self.config.max_connections, self.config.max_queued)
            })
            .clone()
    }

    /// Registry the HTTP endpoint reports its connections to.
    pub fn http_connections(&self) -> Arc<HttpConnections> {
        self.http_connections.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sessions currently in PLAY state.
    pub fn viewers(&self) -> Vec<Viewer> {
        self.sessions
            .playing_sessions()
            .iter()
            .filter_map(|session| {
                session.transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    peer: session.peer,
                    transport: transport.kind(),
                    packets_sent: session.stats().packets(),
                })
            })
            .collect()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            encoder: self.encoder.as_ref().map(|e| e.snapshot()),
            active_sessions: self.sessions.active_count(),
            playing_sessions: self.sessions.playing_count(),
            http_connections: self.http_connections.list(),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Information about a connected viewer (client in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub peer: SocketAddr,
    /// `"udp"` or `"tcp"`.
    pub transport: &'static str,
    pub packets_sent: u64,
}

/// Telemetry exposed to the control layer.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub encoder: Option<EncoderSnapshot>,
    pub active_sessions: usize,
    pub playing_sessions: usize,
    pub http_connections: Vec<HttpConnectionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addr_requires_start() {
        let mut server = Server::new("127.0.0.1:0", Arc::new(SampleBus::new()));
        assert!(matches!(server.local_addr(), Err(StreamError::NotStarted)));
        server.start().unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(matches!(server.start(), Err(StreamError::AlreadyRunning)));
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn status_without_encoder() {
        let server = Server::new("127.0.0.1:0", Arc::new(SampleBus::new()));
        let status = server.status();
        assert!(status.encoder.is_none());
        assert_eq!(status.active_sessions, 0);
        assert!(status.http_connections.is_empty());
    }
}
