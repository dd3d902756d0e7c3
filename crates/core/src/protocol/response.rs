use crate::error::StreamError;

/// An RTSP response (RFC 2326 §7).
///
/// Serializes to the standard text format:
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Uses a builder pattern: chain [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then call [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
#[derive(Debug)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "streamcore/0.1";

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    /// 455: the method is not allowed in the session's current state.
    pub fn method_not_valid_in_state() -> Self {
        Self::new(455, "Method Not Valid in This State")
    }

    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn service_unavailable() -> Self {
        Self::new(503, "Service Unavailable")
    }

    /// Status for a request that failed with `error`.
    pub fn from_error(error: &StreamError) -> Self {
        match error {
            StreamError::InvalidState { .. } => Self::method_not_valid_in_state(),
            StreamError::SessionNotFound(_) => Self::session_not_found(),
            StreamError::Transport(reason) if reason.contains("multicast") => {
                Self::unsupported_transport()
            }
            StreamError::Transport(_) | StreamError::Parse { .. } => Self::bad_request(),
            StreamError::Rejected | StreamError::EncoderUnavailable => Self::service_unavailable(),
            _ => Self::internal_error(),
        }
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically
    /// (RFC 2326 §12.14).
    pub fn serialize(&self) -> String {
        let mut response = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);

        for (name, value) in &self.headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            response.push_str(&format!("Content-Length: {}\r\n", body.len()));
            response.push_str("\r\n");
            response.push_str(body);
        } else {
            response.push_str("\r\n");
        }
        response
    }
}
