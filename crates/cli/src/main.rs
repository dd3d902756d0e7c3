use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use streamcore::encoder::stub::StubEncoderFactory;
use streamcore::encoder::{EncoderOrchestrator, PressureState};
use streamcore::session::watchdog::{Backoff, RecoveryOutcome, Watchdog};
use streamcore::source::TestPatternSource;
use streamcore::{
    BitrateMode, ControlCommand, HttpServer, Pipeline, SampleBus, Server, ServerConfig,
    StreamConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "streamcore-server",
    about = "Live H.264 test stream over RTSP and fragmented MP4"
)]
struct Args {
    /// RTSP bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// fMP4 HTTP bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_bind: String,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Bitrate in bits/s; derived from the resolution when omitted
    #[arg(long)]
    bitrate: Option<u32>,

    /// cbr, vbr or cq
    #[arg(long, default_value = "vbr")]
    mode: BitrateMode,

    /// Extra bytes per source row, to exercise strided conversion
    #[arg(long, default_value_t = 0)]
    pad: usize,

    /// Public host advertised in SDP
    #[arg(long)]
    public_host: Option<String>,

    /// Maximum concurrent RTSP + HTTP connections
    #[arg(long, default_value_t = 16)]
    max_connections: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let stream_config = StreamConfig {
        width: args.width,
        height: args.height,
        fps: args.fps,
        bitrate: args.bitrate,
        bitrate_mode: args.mode,
        ..StreamConfig::default()
    };
    let server_config = ServerConfig {
        public_host: args.public_host.clone(),
        payload_type: stream_config.payload_type,
        rtp_payload_budget: stream_config.rtp_payload_budget,
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };

    let bus = Arc::new(SampleBus::new());
    let orchestrator = EncoderOrchestrator::new(stream_config, Box::new(StubEncoderFactory::new()));
    let source = TestPatternSource::new(args.width, args.height, args.fps).with_row_padding(args.pad);

    let mut pipeline = match Pipeline::spawn(orchestrator, Box::new(source), bus.clone()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to start encode loop: {}", e);
            return;
        }
    };

    let mut server = Server::new(&args.bind, bus.clone())
        .with_config(server_config.clone())
        .with_encoder_status(pipeline.status());
    if let Err(e) = server.start() {
        eprintln!("Failed to start RTSP server: {}", e);
        return;
    }

    let mut http = HttpServer::new(
        &args.http_bind,
        bus,
        server.admission(),
        server.http_connections(),
    )
    .with_queue_depth(server_config.session_queue_depth);
    if let Err(e) = http.start() {
        eprintln!("Failed to start HTTP server: {}", e);
        return;
    }

    let controller = pipeline.controller();
    let watchdog = Watchdog::new(
        Duration::from_secs(3),
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
    )
    .spawn(Duration::from_millis(500), pipeline.liveness(), move |_attempt| {
        match controller.send(ControlCommand::ResetEncoder) {
            Ok(()) => RecoveryOutcome::Attempted,
            Err(_) => RecoveryOutcome::Failed("encode loop is gone".into()),
        }
    });
    let _watchdog = match watchdog {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start watchdog: {}", e);
            return;
        }
    };

    println!(
        "RTSP on rtsp://{}/stream, fMP4 on http://{}/stream.mp4",
        args.bind, args.http_bind
    );
    println!("Commands: status | bitrate <bps> | fps <n> | size <w>x<h> | pressure <nominal|elevated|critical>");
    println!("Press Enter on an empty line to stop");

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        match parse_command(line) {
            Some(Command::Status) => println!("{:#?}", server.status()),
            Some(Command::Control(cmd)) => {
                if !pipeline.control(cmd) {
                    eprintln!("encode loop has stopped");
                }
            }
            None => eprintln!("unrecognized command: {line}"),
        }
    }

    http.stop();
    server.stop();
    pipeline.stop();
}

enum Command {
    Status,
    Control(ControlCommand),
}

fn parse_command(line: &str) -> Option<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let arg = words.next();
    let command = match (verb, arg) {
        ("status", None) => Command::Status,
        ("bitrate", Some(v)) => Command::Control(ControlCommand::SetBitrate(v.parse().ok()?)),
        ("mode", Some(v)) => Command::Control(ControlCommand::SetBitrateMode(v.parse().ok()?)),
        ("fps", Some(v)) => Command::Control(ControlCommand::SetFrameRate(v.parse().ok()?)),
        ("size", Some(v)) => {
            let (w, h) = v.split_once('x')?;
            Command::Control(ControlCommand::SetResolution {
                width: w.parse().ok()?,
                height: h.parse().ok()?,
            })
        }
        ("pressure", Some(v)) => {
            let level = match v {
                "nominal" => PressureState::Nominal,
                "elevated" => PressureState::Elevated,
                "critical" => PressureState::Critical,
                _ => return None,
            };
            Command::Control(ControlCommand::Pressure(level))
        }
        _ => return None,
    };
    Some(command)
}
