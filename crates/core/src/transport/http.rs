//! Live fMP4 over plain HTTP/1.1.
//!
//! `GET /stream.mp4` answers with `Content-Type: video/mp4` and a
//! close-delimited body: the init segment, then one fragment per sample
//! for as long as the client keeps reading.

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::media::StreamEvent;
use crate::mp4::{CONTENT_TYPE, Fmp4Stream};
use crate::pipeline::SampleBus;
use crate::session::{AdmissionPool, HttpConnections, Permit};
use crate::transport::{MAX_HEAD_LEN, read_line_bounded};

/// Path of the live stream.
pub const STREAM_PATH: &str = "/stream.mp4";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_POLL: Duration = Duration::from_millis(100);
const MAX_HEAD_LINES: usize = 100;

/// HTTP endpoint serving the fMP4 stream to any number of viewers.
pub struct HttpServer {
    bind_addr: String,
    bus: Arc<SampleBus>,
    admission: Arc<AdmissionPool>,
    connections: Arc<HttpConnections>,
    queue_depth: usize,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct HttpContext {
    bus: Arc<SampleBus>,
    connections: Arc<HttpConnections>,
    queue_depth: usize,
    running: Arc<AtomicBool>,
}

impl HttpServer {
    pub fn new(
        bind_addr: &str,
        bus: Arc<SampleBus>,
        admission: Arc<AdmissionPool>,
        connections: Arc<HttpConnections>,
    ) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            bus,
            admission,
            connections,
            queue_depth: 64,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            accept_thread: None,
        }
    }

    /// Events buffered per viewer before the bus sheds them.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
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

        let ctx = HttpContext {
            bus: self.bus.clone(),
            connections: self.connections.clone(),
            queue_depth: self.queue_depth,
            running: self.running.clone(),
        };
        let pool = self.admission.clone();

        tracing::info!(addr = %local_addr, path = STREAM_PATH, "fMP4 HTTP server listening");

        let handle = thread::Builder::new()
            .name("http-accept".into())
            .spawn(move || accept_loop(listener, pool, ctx))?;
        self.local_addr = Some(local_addr);
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stop accepting; open streams end within one poll interval.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("fMP4 HTTP server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(StreamError::NotStarted)
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, pool: Arc<AdmissionPool>, ctx: HttpContext) {
    while ctx.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let Ok(admission) = pool.admit() else {
                    tracing::warn!(%peer, "HTTP connection rejected, server at capacity");
                    let _ = write_status(&mut stream, "503 Service Unavailable");
                    continue;
                };
                let c = ctx.clone();
                let spawned = thread::Builder::new()
                    .name("http-conn".into())
                    .spawn(move || {
                        if let Some(permit) = admission.into_permit() {
                            serve(stream, peer, c, permit);
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!(%peer, error = %e, "failed to spawn HTTP connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if ctx.running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "HTTP accept error");
                }
            }
        }
    }
    tracing::debug!("HTTP accept loop exited");
}

fn write_status(stream: &mut TcpStream, status: &str) -> io::Result<()> {
    let response =
        format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes())
}

/// Read the request head and return `(method, path)`, or `None` when the
/// head exceeds [`MAX_HEAD_LEN`].
fn read_request(stream: &TcpStream) -> io::Result<Option<(String, String)>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let Some(mut used) = read_line_bounded(&mut reader, &mut request_line, MAX_HEAD_LEN)? else {
        return Ok(None);
    };
    for _ in 0..MAX_HEAD_LINES {
        let mut line = String::new();
        let Some(n) = read_line_bounded(&mut reader, &mut line, MAX_HEAD_LEN - used)? else {
            return Ok(None);
        };
        used += n;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();
    Ok(Some((method, path)))
}

fn serve(mut stream: TcpStream, peer: SocketAddr, ctx: HttpContext, permit: Permit) {
    let _ = stream.set_read_timeout(Some(REQUEST_TIMEOUT));
    let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));

    let (method, path) = match read_request(&stream) {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::warn!(%peer, limit = MAX_HEAD_LEN, "HTTP request head too large");
            let _ = write_status(&mut stream, "431 Request Header Fields Too Large");
            return;
        }
        Err(e) => {
            tracing::debug!(%peer, error = %e, "HTTP request read failed");
            return;
        }
    };
    if method != "GET" || path != STREAM_PATH {
        tracing::debug!(%peer, method = %method, path = %path, "HTTP request for unknown resource");
        let _ = write_status(&mut stream, "404 Not Found");
        return;
    }

    let guard = ctx.connections.register(peer, &path);
    let events = ctx.bus.subscribe(&format!("http-{}", guard.id()), ctx.queue_depth);
    let mut fmp4 = Fmp4Stream::with_format(ctx.bus.latest_format());

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {CONTENT_TYPE}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n"
    );
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }
    tracing::info!(%peer, id = guard.id(), "fMP4 viewer connected");

    let mut bytes = 0u64;
    let reason = loop {
        if !ctx.running.load(Ordering::SeqCst) {
            break "server shutting down";
        }
        let event = match events.recv_timeout(EVENT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break "bus closed",
        };

        // A format event shed from a full queue is recovered from the bus.
        if let StreamEvent::Sample(sample) = &event
            && fmp4.epoch() != Some(sample.epoch)
            && let Some(format) = ctx.bus.latest_format()
            && format.epoch == sample.epoch
        {
            fmp4.push(&StreamEvent::Format(format));
        }

        let mut failed = false;
        for chunk in fmp4.push(&event) {
            if stream.write_all(&chunk).is_err() {
                failed = true;
                break;
            }
            bytes += chunk.len() as u64;
            tracing::trace!(%peer, len = chunk.len(), "fMP4 chunk written");
        }
        if failed {
            break "write error";
        }
    };

    tracing::info!(
        %peer,
        id = guard.id(),
        fragments = fmp4.fragments(),
        bytes,
        reason,
        "fMP4 viewer disconnected"
    );
    drop(guard);
    drop(permit);
}
