use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::StreamError;
use crate::media::h264::H264Packetizer;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::ServerContext;
use crate::session::delivery::SharedWriter;
use crate::session::{
    DeliveryHandle, Session, SessionSink, SessionState, Transport, TransportHeader,
};
use crate::transport::UdpTransport;

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection.
///
/// The connection owns exactly one live session at a time. After TEARDOWN
/// the old ID is remembered so a repeated TEARDOWN still succeeds, and the
/// next SETUP starts a fresh session.
pub struct MethodHandler {
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    local_ip: IpAddr,
    writer: SharedWriter,
    session: Arc<Session>,
    retired: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        ctx: Arc<ServerContext>,
        peer: SocketAddr,
        local_ip: IpAddr,
        writer: SharedWriter,
    ) -> Self {
        let session = Self::open_session(&ctx, peer, &writer);
        MethodHandler {
            ctx,
            peer,
            local_ip,
            writer,
            session,
            retired: Vec::new(),
        }
    }

    /// The connection's current session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" => self.handle_get_parameter(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    /// Terminate and deregister the connection's session.
    pub fn cleanup(&mut self) {
        if self.session.terminate() {
            tracing::info!(session_id = %self.session.id, peer = %self.peer, "session terminated on disconnect");
        }
        self.ctx.sessions.remove_session(&self.session.id);
    }

    fn open_session(ctx: &ServerContext, peer: SocketAddr, writer: &SharedWriter) -> Arc<Session> {
        let packetizer = H264Packetizer::with_random_ssrc(ctx.config.payload_type)
            .with_payload_budget(ctx.config.rtp_payload_budget);
        let session = ctx.sessions.create_session(peer, Box::new(packetizer));
        match writer.lock().try_clone() {
            Ok(control) => session.attach_control(control),
            Err(e) => tracing::warn!(session_id = %session.id, error = %e, "could not keep control handle"),
        }
        session
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Host for the SDP origin line: configured, else from the URI, else
    /// the address the client connected to.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.ctx.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.local_ip.to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let config = &self.ctx.config;
        let Some(format) = self
            .ctx
            .bus
            .wait_for_format(config.describe_timeout, config.describe_poll)
        else {
            let (frames_encoded, encoder_present) = match &self.ctx.encoder {
                Some(status) => (status.frames_encoded(), status.encoder_present()),
                None => (0, false),
            };
            tracing::warn!(
                %cseq,
                waited_ms = config.describe_timeout.as_millis() as u64,
                frames_encoded,
                encoder_present,
                "DESCRIBE timed out waiting for codec config"
            );
            let body = format!(
                "codec configuration not available\r\nframes_encoded: {frames_encoded}\r\nencoder_present: {encoder_present}\r\n"
            );
            return RtspResponse::service_unavailable()
                .add_header("CSeq", cseq)
                .add_header("Retry-After", "1")
                .add_header("Content-Type", "text/plain")
                .with_body(body);
        };

        let host = self.advertised_host(uri);
        let sdp = sdp::generate_sdp(Some(&format.config), config.payload_type, &host, config);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.session.is_terminated() {
            self.session = Self::open_session(&self.ctx, self.peer, &self.writer);
        }
        let session = self.session.clone();

        if let Err(e) = session.can_setup() {
            tracing::warn!(%cseq, session_id = %session.id, error = %e, "SETUP rejected");
            return RtspResponse::from_error(&e).add_header("CSeq", cseq);
        }

        let Some(header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        let requested = match TransportHeader::parse(header) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(%cseq, transport = header, error = %e, "SETUP invalid Transport header");
                return RtspResponse::from_error(&e).add_header("CSeq", cseq);
            }
        };

        let (transport, sink) = match self.bind_transport(requested) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(%cseq, session_id = %session.id, error = %e, "failed to allocate transport");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        };

        let events = self.ctx.bus.subscribe(
            &format!("rtsp-{}", session.id),
            self.ctx.config.session_queue_depth,
        );
        let delivery =
            match DeliveryHandle::spawn(session.clone(), sink, events, self.ctx.bus.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "failed to start delivery");
                    return RtspResponse::internal_error().add_header("CSeq", cseq);
                }
            };

        if let Err(e) = session.setup(transport, delivery) {
            return RtspResponse::from_error(&e).add_header("CSeq", cseq);
        }

        let ssrc = session.ssrc();
        tracing::info!(
            session_id = %session.id,
            peer = %self.peer,
            uri = %request.uri,
            transport = transport.kind(),
            ssrc,
            "session set up"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport.response_header(ssrc))
            .add_header("Session", &session.session_header_value())
    }

    fn bind_transport(
        &self,
        requested: TransportHeader,
    ) -> crate::error::Result<(Transport, SessionSink)> {
        match requested {
            TransportHeader::Udp {
                client_rtp,
                client_rtcp,
            } => {
                let client_addr = SocketAddr::new(self.peer.ip(), client_rtp);
                let udp = UdpTransport::bind(self.local_ip, client_addr)?;
                let (server_rtp_port, server_rtcp_port) = udp.server_ports()?;
                let transport = Transport::Udp {
                    client_rtp: client_addr,
                    client_rtcp_port: client_rtcp,
                    server_rtp_port,
                    server_rtcp_port,
                };
                Ok((transport, SessionSink::Udp(udp)))
            }
            TransportHeader::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => Ok((
                Transport::Interleaved {
                    rtp_channel,
                    rtcp_channel,
                },
                SessionSink::Interleaved {
                    writer: self.writer.clone(),
                    channel: rtp_channel,
                },
            )),
        }
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.resolve_session(request, "PLAY") {
            Ok(s) => s,
            Err(e) => return RtspResponse::from_error(&e).add_header("CSeq", cseq),
        };

        match session.play() {
            Ok(started) => {
                if started {
                    tracing::info!(session_id = %session.id, "session started playing");
                }
                let (seq, rtptime) = session.rtp_position();
                let rtp_info = format!("url={};seq={};rtptime={}", request.uri, seq, rtptime);
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
                    .add_header("Range", "npt=0.000-")
                    .add_header("RTP-Info", &rtp_info)
            }
            Err(e) => {
                tracing::warn!(%cseq, session_id = %session.id, error = %e, "PLAY rejected");
                RtspResponse::from_error(&e).add_header("CSeq", cseq)
            }
        }
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let session = match self.resolve_session(request, "PAUSE") {
            Ok(s) => s,
            Err(e) => return RtspResponse::from_error(&e).add_header("CSeq", cseq),
        };

        match session.pause() {
            Ok(()) => {
                tracing::info!(session_id = %session.id, "session paused");
                RtspResponse::ok()
                    .add_header("CSeq", cseq)
                    .add_header("Session", &session.session_header_value())
            }
            Err(e) => {
                tracing::warn!(%cseq, session_id = %session.id, error = %e, "PAUSE rejected");
                RtspResponse::from_error(&e).add_header("CSeq", cseq)
            }
        }
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if self.retired.iter().any(|r| r == id) {
            tracing::debug!(session_id = id, "repeated TEARDOWN");
            return RtspResponse::ok().add_header("CSeq", cseq);
        }
        if id != self.session.id {
            tracing::warn!(session_id = id, "TEARDOWN for unknown session");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        }

        self.session.terminate();
        self.ctx.sessions.remove_session(&self.session.id);
        self.retired.push(self.session.id.clone());
        tracing::info!(session_id = %self.session.id, "session terminated via TEARDOWN");
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(id) = request.session_id()
            && id == self.session.id
        {
            resp = resp.add_header("Session", &self.session.session_header_value());
        }
        resp
    }

    /// The connection's session, if `request` names it and it was set up.
    fn resolve_session(
        &self,
        request: &RtspRequest,
        method: &str,
    ) -> crate::error::Result<Arc<Session>> {
        let session = &self.session;
        match request.session_id() {
            Some(id) if id == session.id && !session.is_terminated() => Ok(session.clone()),
            Some(id) => Err(StreamError::SessionNotFound(id.to_string())),
            // Nothing was ever handed out, so the method is simply early.
            None if session.state() == SessionState::Init => Err(StreamError::InvalidState {
                method: method.to_string(),
                state: SessionState::Init.to_string(),
            }),
            None => Err(StreamError::SessionNotFound(String::new())),
        }
    }
}
