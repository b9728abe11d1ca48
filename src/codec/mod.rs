//! Encoder and container primitives wrapped by the output stage.
//!
//! The output stage only depends on the contracts below:
//! - [`Encode`]: submit a frame or end-of-stream, retrieve packets, reset
//! - [`Container`]: per-stream time bases, packet writes, finalisation
//! - [`CodecBackend`]: allocation of both
//!
//! Two backends implement them: [`memory`] (deterministic, in-process) and,
//! with the `ffmpeg` feature, `ffmpeg` (libavcodec/libavformat via rsmpeg).

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod memory;

use crate::media::{Frame, FrameFormat, MediaKind, Packet, Rational};
use crate::output::{HardwareConfig, OutputConfig};
use std::collections::BTreeMap;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegBackend;
pub use memory::{BackendCounters, MemoryBackend, MemorySink};

/// Failures reported by backend primitives.
///
/// Call sites map these onto [`OutputError`](crate::OutputError) according to
/// the operation that failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("{0}")]
    Fault(String),
    #[error("I/O failure: {0}")]
    Io(String),
}

/// Result of asking an encoder for its next packet.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveOutcome {
    /// A packet in the encoder's time base.
    Packet(Packet),
    /// Nothing ready until more input is submitted.
    Again,
    /// End-of-stream reached; no further packets will ever be produced.
    Flushed,
}

/// Fully resolved settings for allocating one encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub codec: String,
    /// Input frames the encoder is configured for.
    pub format: FrameFormat,
    pub frame_rate: Option<Rational>,
    pub time_base: Rational,
    pub bitrate: Option<u64>,
    /// Keyframe interval in frames.
    pub gop_size: Option<u32>,
    pub hardware: Option<HardwareConfig>,
    pub options: BTreeMap<String, String>,
}

impl EncoderParams {
    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn is_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    /// Whether an encoder opened with `self` can serve a stream needing `other`
    /// without being reconfigured.
    ///
    /// Rate control, GOP and private options are fixed when the session is
    /// opened, so every setting has to match.
    pub fn is_compatible(&self, other: &EncoderParams) -> bool {
        self.codec == other.codec
            && self.format == other.format
            && self.frame_rate == other.frame_rate
            && self.time_base == other.time_base
            && self.bitrate == other.bitrate
            && self.gop_size == other.gop_size
            && self.hardware == other.hardware
            && self.options == other.options
    }
}

/// What a container needs to know to declare one output stream.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub codec: String,
    pub format: FrameFormat,
    /// Requested stream time base; the container may pick another.
    pub time_base: Rational,
    pub frame_rate: Option<Rational>,
    pub bitrate: Option<u64>,
    /// Parameters exported by an opened FFmpeg encoder, extradata included.
    #[cfg(feature = "ffmpeg")]
    pub codecpar: Option<ffmpeg::EncoderCodecPar>,
}

impl StreamParams {
    pub fn new(codec: &str, format: FrameFormat, time_base: Rational) -> Self {
        Self {
            codec: codec.to_string(),
            format,
            time_base,
            frame_rate: None,
            bitrate: None,
            #[cfg(feature = "ffmpeg")]
            codecpar: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: Option<Rational>) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_bitrate(mut self, bitrate: Option<u64>) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }
}

/// An encoder handle. Not designed for concurrent submission: every method
/// takes `&mut self`.
pub trait Encode: Send {
    fn name(&self) -> &str;

    /// Time base of emitted packets and of submitted frame timestamps.
    fn time_base(&self) -> Rational;

    /// Whether the handle is bound to accelerator resources.
    fn is_hardware(&self) -> bool;

    /// Parameters the container needs to declare a stream for this encoder.
    fn stream_params(&self) -> StreamParams;

    /// Submit one frame; `pts` is already in [`Encode::time_base`].
    fn send_frame(&mut self, frame: &Frame, pts: Option<i64>) -> Result<(), CodecError>;

    /// Submit the end-of-stream marker.
    fn send_eof(&mut self) -> Result<(), CodecError>;

    /// Retrieve the next ready packet, if any.
    fn receive_packet(&mut self) -> Result<ReceiveOutcome, CodecError>;

    /// Return a fully flushed encoder to accepting frames while keeping its
    /// device and session state.
    fn reset(&mut self) -> Result<(), CodecError>;
}

/// A container handle with its declared streams.
pub trait Container: Send {
    /// Time base of stream `index` as chosen by the container.
    fn stream_time_base(&self, index: usize) -> Option<Rational>;

    /// Append a packet whose timestamps are already in the stream's time base.
    fn write_packet(&mut self, packet: &Packet) -> Result<(), CodecError>;

    /// Write the trailer and release the destination. Idempotent.
    fn finish(&mut self) -> Result<(), CodecError>;
}

/// Allocates encoders and containers.
pub trait CodecBackend {
    fn open_encoder(&self, params: &EncoderParams) -> Result<Box<dyn Encode>, CodecError>;

    fn open_container(
        &self,
        config: &OutputConfig,
        streams: &[StreamParams],
    ) -> Result<Box<dyn Container>, CodecError>;
}
