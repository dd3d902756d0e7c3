use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};
use crate::server::ServerContext;
use crate::session::delivery::SharedWriter;
use crate::session::{Admission, Permit};
use crate::transport::{MAX_HEAD_LEN, read_line_bounded};

/// Marker byte of an interleaved binary frame (RFC 2326 §10.12).
pub const INTERLEAVED_MAGIC: u8 = b'$';

/// Largest request body accepted; anything bigger ends the connection.
const MAX_BODY_LEN: usize = 64 * 1024;

/// A client that stops reading must not wedge its delivery worker forever.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame an RTP or RTCP packet for the RTSP control connection.
///
/// ```
/// use streamcore::transport::tcp::interleave_frame;
///
/// assert_eq!(interleave_frame(1, &[0xAA, 0xBB]), [b'$', 1, 0, 2, 0xAA, 0xBB]);
/// ```
pub fn interleave_frame(channel: u8, packet: &[u8]) -> Vec<u8> {
    // The packetizer clamps its budget so packets fit in 16 bits.
    debug_assert!(packet.len() <= u16::MAX as usize);
    let len = packet.len() as u16;
    let mut framed = Vec::with_capacity(4 + packet.len());
    framed.push(INTERLEAVED_MAGIC);
    framed.push(channel);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(packet);
    framed
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
/// Every connection goes through the admission pool first.
pub fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    while ctx.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let admission = match ctx.admission.admit() {
                    Ok(admission) => admission,
                    Err(_) => {
                        reject(stream, peer);
                        continue;
                    }
                };
                if matches!(admission, Admission::Queued(_)) {
                    tracing::info!(%peer, queued = ctx.admission.queued(), "connection queued");
                }
                let c = ctx.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-conn".into())
                    .spawn(move || {
                        if let Some(permit) = admission.into_permit() {
                            Connection::handle(stream, c, permit);
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!(%peer, error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if ctx.running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn reject(mut stream: TcpStream, peer: SocketAddr) {
    tracing::warn!(%peer, "connection rejected, server at capacity");
    let response = RtspResponse::service_unavailable()
        .add_header("CSeq", "0")
        .add_header("Retry-After", "5");
    let _ = stream.write_all(response.serialize().as_bytes());
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

enum Incoming {
    Request(RtspRequest),
    /// A `$` frame from the client, already discarded.
    Interleaved,
    Malformed,
    /// Head or body over its limit. The stream cannot be resynchronized.
    TooLarge,
    Blank,
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: SharedWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, ctx: Arc<ServerContext>, permit: Permit) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
            tracing::debug!(%peer_addr, error = %e, "could not set write timeout");
        }

        let running = ctx.running.clone();
        let writer: SharedWriter = Arc::new(Mutex::new(stream));
        let handler = MethodHandler::new(ctx, peer_addr, local_addr.ip(), writer.clone());

        tracing::info!(%peer_addr, session_id = %handler.session().id, "client connected");

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
        };

        let reason = conn.run(|| running.load(Ordering::SeqCst));
        conn.handler.cleanup();
        drop(permit);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: impl Fn() -> bool) -> &'static str {
        while running() {
            let request = match self.next_message() {
                Ok(Some(Incoming::Request(request))) => request,
                Ok(Some(Incoming::Interleaved | Incoming::Blank)) => continue,
                Ok(Some(Incoming::Malformed)) => {
                    let response = RtspResponse::bad_request().add_header("CSeq", "0");
                    if self.send(&response).is_err() {
                        return "write error";
                    }
                    continue;
                }
                Ok(Some(Incoming::TooLarge)) => {
                    tracing::warn!(peer = %self.peer_addr, "request too large");
                    let response = RtspResponse::bad_request().add_header("CSeq", "0");
                    let _ = self.send(&response);
                    return "request too large";
                }
                Ok(None) => return "connection closed by client",
                Err(_) => return "read error",
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                cseq = request.cseq().unwrap_or("-"),
                "request"
            );

            let response = self.handler.handle(&request);

            tracing::debug!(
                peer = %self.peer_addr,
                status = response.status_code,
                "response"
            );

            if self.send(&response).is_err() {
                return "write error";
            }
        }

        "server shutting down"
    }

    fn send(&self, response: &RtspResponse) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(response.serialize().as_bytes())?;
        writer.flush()
    }

    /// Read the next request or interleaved frame. `None` on EOF.
    fn next_message(&mut self) -> io::Result<Option<Incoming>> {
        let first = match self.reader.fill_buf()? {
            [] => return Ok(None),
            buf => buf[0],
        };

        if first == INTERLEAVED_MAGIC {
            let mut header = [0u8; 4];
            self.reader.read_exact(&mut header)?;
            let len = u16::from_be_bytes([header[2], header[3]]) as u64;
            io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
            tracing::trace!(peer = %self.peer_addr, channel = header[1], len, "discarded interleaved frame");
            return Ok(Some(Incoming::Interleaved));
        }

        let mut head = String::new();
        loop {
            let mut line = String::new();
            let limit = MAX_HEAD_LEN.saturating_sub(head.len());
            match read_line_bounded(&mut self.reader, &mut line, limit)? {
                None => return Ok(Some(Incoming::TooLarge)),
                Some(0) => return Ok(None),
                Some(_) => {}
            }
            let blank = line == "\r\n" || line == "\n";
            if blank && head.is_empty() {
                return Ok(Some(Incoming::Blank));
            }
            head.push_str(&line);
            if blank {
                break;
            }
        }

        let mut request = match RtspRequest::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                return Ok(Some(Incoming::Malformed));
            }
        };

        let body_len = request.content_length();
        if body_len > MAX_BODY_LEN {
            return Ok(Some(Incoming::TooLarge));
        }
        if body_len > 0 {
            let mut body = vec![0u8; body_len];
            self.reader.read_exact(&mut body)?;
            request.body = body;
        }
        Ok(Some(Incoming::Request(request)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_frame_header() {
        let framed = interleave_frame(0, &[0u8; 300]);
        assert_eq!(&framed[..4], &[b'$', 0, 0x01, 0x2c]);
        assert_eq!(framed.len(), 304);
    }
}
