//! Live H.264 streaming core.
//!
//! Raw frames go through an [`EncoderOrchestrator`](encoder::EncoderOrchestrator)
//! on a single encode loop ([`pipeline`]); encoded samples are broadcast on
//! a [`SampleBus`](pipeline::SampleBus) to RTSP sessions (RTP over UDP or
//! interleaved TCP) and to fMP4-over-HTTP viewers.

pub mod config;
pub mod encoder;
pub mod error;
pub mod media;
pub mod mp4;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod source;
pub mod transport;

pub use config::{BitrateMode, StreamConfig};
pub use error::{Result, StreamError};
pub use media::{CodecConfig, EncodedSample, Packetizer, StreamEvent, StreamFormat};
pub use pipeline::{ControlCommand, Pipeline, SampleBus};
pub use server::{Server, ServerConfig, ServerStatus, Viewer};
pub use transport::HttpServer;
