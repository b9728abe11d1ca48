//! Transcode Output
//!
//! Output stage of a media transcoding pipeline: turns filtered frames into
//! compressed packets and writes them into a container.
//!
//! # Features
//!
//! - Encoder driving with exact buffering and end-of-stream flush
//! - Exact time base rescaling with strictly increasing stream timestamps
//! - Output context lifecycle with hardware encoder reuse across outputs
//! - Bounded frame queue and a pipeline runner with statistics
//! - FFmpeg backend via rsmpeg (when the `ffmpeg` feature is enabled)
//! - In-memory backend for tests, benchmarks and dry runs

pub mod codec;
pub mod error;
pub mod media;
pub mod output;
pub mod pipeline;

// Re-export commonly used types
pub use codec::{CodecBackend, CodecError, Container, Encode, MemoryBackend, ReceiveOutcome};
#[cfg(feature = "ffmpeg")]
pub use codec::FfmpegBackend;
pub use error::{OutputError, Result};
pub use media::{
    CodecParameters, FilterContext, Frame, FrameFormat, InputContext, MediaKind, Packet,
    PixelFormat, Rational, SampleFormat,
};
pub use output::{
    mux, process, ClosePolicy, EncoderConfig, HardwareConfig, HardwareEncoders, MonotonicPolicy,
    OutputConfig, OutputContext, OutputStats, WriteErrorPolicy,
};
pub use pipeline::{run, OutputQueue, QueueItem, QueueSender};
