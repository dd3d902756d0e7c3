//! Integration tests: a real server on loopback driven by std sockets.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use streamcore::encoder::EncoderOrchestrator;
use streamcore::encoder::stub::StubEncoderFactory;
use streamcore::media::rtp::ParsedHeader;
use streamcore::session::{AdmissionPool, HttpConnections};
use streamcore::source::TestPatternSource;
use streamcore::transport::MAX_HEAD_LEN;
use streamcore::{
    CodecConfig, EncodedSample, HttpServer, Pipeline, SampleBus, Server, ServerConfig,
    StreamConfig, StreamEvent, StreamFormat,
};

const TIMEOUT: Duration = Duration::from_secs(3);

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn session_id(&self) -> String {
        let value = self.header("Session").expect("Session header");
        value.split(';').next().unwrap().to_string()
    }
}

/// RTSP client over one TCP connection. Keeps a single buffered reader so
/// responses and interleaved frames are never lost between calls.
struct RtspClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    uri: String,
    cseq: u32,
    /// Interleaved frames read while waiting for a response.
    frames: Vec<(u8, Vec<u8>)>,
}

impl RtspClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, TIMEOUT).expect("connect to server");
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream.set_write_timeout(Some(TIMEOUT)).unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            uri: format!("rtsp://{}/stream", addr),
            cseq: 0,
            frames: Vec::new(),
        }
    }

    fn request(&mut self, method: &str, headers: &[(&str, &str)]) -> Response {
        self.cseq += 1;
        let uri = match method {
            "SETUP" => format!("{}/track1", self.uri),
            _ => self.uri.clone(),
        };
        let mut text = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, uri, self.cseq);
        for (name, value) in headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");
        self.writer.write_all(text.as_bytes()).unwrap();

        let response = self.read_response();
        assert_eq!(
            response.header("CSeq"),
            Some(self.cseq.to_string().as_str()),
            "CSeq must be echoed"
        );
        response
    }

    fn read_response(&mut self) -> Response {
        loop {
            let first = self.reader.fill_buf().unwrap()[0];
            if first == b'$' {
                let frame = self.read_frame_raw();
                self.frames.push(frame);
                continue;
            }
            break;
        }

        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut response = Response {
            status,
            headers,
            body: String::new(),
        };
        if let Some(len) = response.header("Content-Length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            self.reader.read_exact(&mut body).unwrap();
            response.body = String::from_utf8(body).unwrap();
        }
        response
    }

    fn read_frame_raw(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).unwrap();
        assert_eq!(header[0], b'$');
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut packet = vec![0u8; len];
        self.reader.read_exact(&mut packet).unwrap();
        (header[1], packet)
    }

    /// Next interleaved frame, including ones buffered during requests.
    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        if !self.frames.is_empty() {
            return self.frames.remove(0);
        }
        self.read_frame_raw()
    }

    fn setup_udp(&mut self, client: &UdpSocket) -> Response {
        let port = client.local_addr().unwrap().port();
        let transport = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
        self.request("SETUP", &[("Transport", &transport)])
    }

    fn setup_tcp(&mut self) -> Response {
        self.request("SETUP", &[("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1")])
    }
}

fn format() -> StreamFormat {
    StreamFormat {
        config: CodecConfig {
            sps: vec![0x67, 0x42, 0xc0, 0x1e, 0xda],
            pps: Some(vec![0x68, 0xce, 0x3c, 0x80]),
        },
        width: 640,
        height: 480,
        fps: 30,
        epoch: 1,
    }
}

fn sample(index: u64, key_frame: bool) -> StreamEvent {
    let nal_header = if key_frame { 0x65 } else { 0x41 };
    let mut data = vec![0, 0, 0, 1, nal_header];
    data.extend((0..3000u32).map(|i| (i % 200) as u8 + 1));
    StreamEvent::Sample(Arc::new(EncodedSample {
        data,
        key_frame,
        pts_us: index * 33_333,
        frame_index: index,
        clock_90k: index * 3000,
        epoch: 1,
    }))
}

fn start_server(bus: &Arc<SampleBus>, config: ServerConfig) -> Server {
    let mut server = Server::new("127.0.0.1:0", bus.clone()).with_config(config);
    server.start().expect("server start");
    server
}

fn udp_client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    socket
}

fn nal_type(packet: &[u8]) -> u8 {
    let payload = &packet[12..];
    match payload[0] & 0x1f {
        28 => payload[1] & 0x1f,
        t => t,
    }
}

#[test]
fn full_handshake_over_udp() {
    let bus = Arc::new(SampleBus::new());
    bus.publish(StreamEvent::Format(Arc::new(format())));
    let server = start_server(&bus, ServerConfig::default());
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    let options = client.request("OPTIONS", &[]);
    assert_eq!(options.status, 200);
    assert!(options.header("Public").unwrap().contains("TEARDOWN"));

    let describe = client.request("DESCRIBE", &[("Accept", "application/sdp")]);
    assert_eq!(describe.status, 200);
    assert_eq!(describe.header("Content-Type"), Some("application/sdp"));
    for line in describe.body.lines() {
        let (key, _) = line.split_once('=').expect("key=value line");
        assert_eq!(key.len(), 1, "bad SDP line {line:?}");
    }
    assert!(describe.body.contains("c=IN IP4 0.0.0.0"));
    assert!(describe.body.contains("m=video 0 RTP/AVP 96"));
    assert!(describe.body.contains("sprop-parameter-sets=Z0LAHto=,aM48gA=="));

    let rtp = udp_client();
    let setup = client.setup_udp(&rtp);
    assert_eq!(setup.status, 200);
    let transport = setup.header("Transport").unwrap().to_string();
    assert!(transport.contains("server_port="), "{transport}");
    let ssrc_hex = transport.rsplit("ssrc=").next().unwrap();
    let ssrc = u32::from_str_radix(ssrc_hex, 16).unwrap();
    let session = setup.session_id();

    let play = client.request("PLAY", &[("Session", &session)]);
    assert_eq!(play.status, 200);
    assert!(play.header("RTP-Info").unwrap().contains("seq=0"));
    assert_eq!(play.header("Range"), Some("npt=0.000-"));

    bus.publish(sample(1, false));
    bus.publish(sample(2, true));

    let mut buf = [0u8; 2048];
    let mut types = Vec::new();
    let mut last_marker = false;
    while !last_marker {
        let n = rtp.recv(&mut buf).unwrap();
        let header = ParsedHeader::parse(&buf[..n]).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.payload_type, 96);
        assert_eq!(header.ssrc, ssrc);
        assert_eq!(header.timestamp, 6000, "delta frame before the keyframe is skipped");
        assert_eq!(header.sequence as usize, types.len());
        assert!(n <= 12 + 1400);
        types.push(nal_type(&buf[..n]));
        last_marker = header.marker;
    }
    assert_eq!(&types[..2], &[7, 8], "parameter sets lead the keyframe");
    assert!(types[2..].iter().all(|&t| t == 5));
    assert!(types.len() > 3, "3000-byte IDR is fragmented");

    let teardown = client.request("TEARDOWN", &[("Session", &session)]);
    assert_eq!(teardown.status, 200);
}

#[test]
fn play_before_setup_is_rejected() {
    let bus = Arc::new(SampleBus::new());
    let server = start_server(&bus, ServerConfig::default());
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    assert_eq!(client.request("PLAY", &[]).status, 455);
    assert_eq!(
        client.request("PLAY", &[("Session", "DEADBEEF")]).status,
        454
    );
    assert_eq!(server.status().playing_sessions, 0);
}

#[test]
fn teardown_is_idempotent() {
    let bus = Arc::new(SampleBus::new());
    let server = start_server(&bus, ServerConfig::default());
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    let setup = client.setup_tcp();
    assert_eq!(setup.status, 200);
    assert!(setup.header("Transport").unwrap().contains("interleaved=0-1"));
    let session = setup.session_id();

    assert_eq!(client.request("TEARDOWN", &[("Session", &session)]).status, 200);
    assert_eq!(client.request("TEARDOWN", &[("Session", &session)]).status, 200);
    assert_eq!(client.request("PLAY", &[("Session", &session)]).status, 454);

    // The connection can start over with a new session.
    let again = client.setup_tcp();
    assert_eq!(again.status, 200);
    assert_ne!(again.session_id(), session);
}

#[test]
fn malformed_transport_keeps_session_in_init() {
    let bus = Arc::new(SampleBus::new());
    let server = start_server(&bus, ServerConfig::default());
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    assert_eq!(
        client
            .request("SETUP", &[("Transport", "RTP/AVP;unicast")])
            .status,
        400
    );
    assert_eq!(client.request("SETUP", &[]).status, 400);
    assert_eq!(
        client
            .request("SETUP", &[("Transport", "RTP/AVP;multicast;port=5000-5001")])
            .status,
        461
    );
    assert_eq!(client.request("PLAY", &[]).status, 455, "still INIT");

    let rtp = udp_client();
    assert_eq!(client.setup_udp(&rtp).status, 200);
}

#[test]
fn two_sessions_deliver_independently() {
    let bus = Arc::new(SampleBus::new());
    bus.publish(StreamEvent::Format(Arc::new(format())));
    let server = start_server(&bus, ServerConfig::default());
    let addr = server.local_addr().unwrap();

    let mut udp_client_conn = RtspClient::connect(addr);
    let rtp = udp_client();
    let udp_session = udp_client_conn.setup_udp(&rtp).session_id();
    assert_eq!(
        udp_client_conn
            .request("PLAY", &[("Session", &udp_session)])
            .status,
        200
    );

    let mut tcp_client = RtspClient::connect(addr);
    let tcp_session = tcp_client.setup_tcp().session_id();
    assert_ne!(udp_session, tcp_session);
    assert_eq!(
        tcp_client.request("PLAY", &[("Session", &tcp_session)]).status,
        200
    );
    assert_eq!(server.status().playing_sessions, 2);
    assert_eq!(server.viewers().len(), 2);

    bus.publish(sample(0, true));

    let mut buf = [0u8; 2048];
    let n = rtp.recv(&mut buf).unwrap();
    let over_udp = ParsedHeader::parse(&buf[..n]).unwrap();

    let (channel, packet) = tcp_client.read_frame();
    assert_eq!(channel, 0);
    let over_tcp = ParsedHeader::parse(&packet).unwrap();

    assert_ne!(over_udp.ssrc, over_tcp.ssrc);
    assert_eq!(over_udp.sequence, 0);
    assert_eq!(over_tcp.sequence, 0);
    assert_eq!(nal_type(&buf[..n]), 7);
    assert_eq!(nal_type(&packet), 7);

    // Pausing one session leaves the other untouched.
    assert_eq!(
        udp_client_conn
            .request("PAUSE", &[("Session", &udp_session)])
            .status,
        200
    );
    assert_eq!(server.status().playing_sessions, 1);
}

#[test]
fn describe_times_out_with_diagnostics() {
    let bus = Arc::new(SampleBus::new());
    let config = ServerConfig {
        describe_timeout: Duration::from_millis(200),
        describe_poll: Duration::from_millis(20),
        ..ServerConfig::default()
    };
    let server = start_server(&bus, config);
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    let describe = client.request("DESCRIBE", &[]);
    assert_eq!(describe.status, 503);
    assert!(describe.header("Retry-After").is_some());
    assert!(describe.body.contains("frames_encoded: 0"));
    assert!(describe.body.contains("encoder_present: false"));

    // The connection stays usable.
    assert_eq!(client.request("OPTIONS", &[]).status, 200);
}

#[test]
fn full_pool_rejects_connection() {
    let bus = Arc::new(SampleBus::new());
    let config = ServerConfig {
        max_connections: 1,
        max_queued: 0,
        ..ServerConfig::default()
    };
    let server = start_server(&bus, config);
    let addr = server.local_addr().unwrap();

    let mut first = RtspClient::connect(addr);
    assert_eq!(first.request("OPTIONS", &[]).status, 200);

    let mut second = RtspClient::connect(addr);
    assert_eq!(second.read_response().status, 503);
}

#[test]
fn oversized_request_head_closes_connection() {
    let bus = Arc::new(SampleBus::new());
    let server = start_server(&bus, ServerConfig::default());
    let addr = server.local_addr().unwrap();

    let mut client = RtspClient::connect(addr);
    client.writer.write_all(&vec![b'A'; MAX_HEAD_LEN]).unwrap();
    assert_eq!(client.read_response().status, 400);
    let mut rest = Vec::new();
    assert_eq!(client.reader.read_to_end(&mut rest).unwrap(), 0);

    let mut other = RtspClient::connect(addr);
    assert_eq!(other.request("OPTIONS", &[]).status, 200);
}

#[test]
fn encoder_pipeline_feeds_interleaved_session() {
    let bus = Arc::new(SampleBus::new());
    let stream_config = StreamConfig {
        width: 64,
        height: 48,
        fps: 30,
        ..StreamConfig::default()
    };
    let orchestrator = EncoderOrchestrator::new(stream_config, Box::new(StubEncoderFactory::new()));
    let source = TestPatternSource::new(64, 48, 30).with_row_padding(8);
    let mut pipeline = Pipeline::spawn(orchestrator, Box::new(source), bus.clone()).unwrap();

    let mut server = Server::new("127.0.0.1:0", bus.clone()).with_encoder_status(pipeline.status());
    server.start().unwrap();
    let mut client = RtspClient::connect(server.local_addr().unwrap());

    let describe = client.request("DESCRIBE", &[]);
    assert_eq!(describe.status, 200);
    assert!(describe.body.contains("profile-level-id=42c0"));

    let session = client.setup_tcp().session_id();
    assert_eq!(client.request("PLAY", &[("Session", &session)]).status, 200);

    let (channel, packet) = client.read_frame();
    assert_eq!(channel, 0);
    let header = ParsedHeader::parse(&packet).unwrap();
    assert_eq!(header.payload_type, 96);
    assert_eq!(nal_type(&packet), 7, "delivery starts at a keyframe");

    let status = server.status();
    let encoder = status.encoder.unwrap();
    assert_eq!(encoder.encoder.as_deref(), Some("stub-h264"));
    assert!(encoder.frames_encoded > 0);

    server.stop();
    pipeline.stop();
}

#[test]
fn http_serves_fragmented_mp4() {
    let bus = Arc::new(SampleBus::new());
    bus.publish(StreamEvent::Format(Arc::new(format())));
    let connections = HttpConnections::new();
    let mut http = HttpServer::new(
        "127.0.0.1:0",
        bus.clone(),
        AdmissionPool::new(4, 0),
        connections.clone(),
    );
    http.start().unwrap();

    let stream = TcpStream::connect(http.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut writer = stream.try_clone().unwrap();
    writer
        .write_all(b"GET /stream.mp4 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" {
            break;
        }
        head.push_str(&line);
    }
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert!(head.contains("Content-Type: video/mp4"));
    assert_eq!(connections.count(), 1);

    bus.publish(sample(0, true));

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header).unwrap();
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        kinds.push(String::from_utf8_lossy(&header[4..]).to_string());
        let mut rest = vec![0u8; size - 8];
        reader.read_exact(&mut rest).unwrap();
    }
    assert_eq!(kinds, ["ftyp", "moov", "moof", "mdat"]);
}
