//! RTSP control plane for the single live stream.
//!
//! Every control connection owns exactly one session, created when the
//! client connects. [`MethodHandler`] walks that session through
//! Init, Ready and Playing and answers each request with a status the
//! client can act on:
//!
//! - `OPTIONS` lists the methods below.
//! - `DESCRIBE` blocks, up to a bound, until the encoder has reported
//!   SPS/PPS, then answers with SDP from [`sdp`]. On timeout it answers
//!   503 with the encoder counters in the body.
//! - `SETUP` binds a UDP pair or, for `RTP/AVP/TCP`, selects `$` channels
//!   on this same connection. A bad `Transport` keeps the session in Init.
//! - `PLAY` / `PAUSE` toggle delivery; PLAY reports `Range` and `RTP-Info`.
//! - `TEARDOWN` can be repeated; the next SETUP starts a new session.
//! - `GET_PARAMETER` with no body is a keepalive.
//!
//! Requests are parsed by [`request`], and [`response`] maps library
//! errors onto RTSP status codes (400, 454, 455, 461, 503).

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
