use crate::error::{ParseErrorKind, StreamError};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2. [`parse`](Self::parse)
/// only sees the head; the connection reads `Content-Length` bytes of body
/// afterwards and stores them in [`body`](Self::body).
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/track1`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Message body, empty unless the request carried `Content-Length`.
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a complete request: request line, headers, and trailing blank
    /// line. Returns [`StreamError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(StreamError::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(StreamError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let mut headers = Vec::new();

        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(StreamError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            headers.push((name, value));
        }

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Declared body length; absent or unparsable counts as zero.
    pub fn content_length(&self) -> usize {
        self.get_header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Session ID from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }
}
