//! Network transport layer for RTSP signaling and media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling, one thread
//!   per connection. Interleaved RTP (RFC 2326 §10.12) shares the same
//!   connection using `$` framing.
//!
//! - **UDP** ([`udp`]): a socket pair per session for RTP delivery.
//!
//! - **HTTP** ([`http`]): fragmented MP4 over a plain HTTP/1.1 response.

use std::io::{self, BufRead, Read};

pub mod http;
pub mod tcp;
pub mod udp;

pub use http::HttpServer;
pub use udp::UdpTransport;

/// Request heads (request line plus headers) larger than this are refused.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Append one line of at most `limit` bytes to `line`.
///
/// Returns the number of bytes read (0 on EOF), or `None` when `limit`
/// bytes arrived without a line ending.
pub(crate) fn read_line_bounded<R: BufRead>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> io::Result<Option<usize>> {
    let n = reader.by_ref().take(limit as u64).read_line(line)?;
    if n == limit && !line.ends_with('\n') {
        return Ok(None);
    }
    Ok(Some(n))
}
