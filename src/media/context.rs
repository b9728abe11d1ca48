//! Read-only descriptions handed to the output stage by its collaborators.

use super::frame::{FrameFormat, MediaKind, PixelFormat, SampleFormat};
use super::timebase::Rational;
use serde::{Deserialize, Serialize};

/// Codec parameters of one source stream, as reported by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParameters {
    pub codec: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub pixel_format: Option<PixelFormat>,
    #[serde(default)]
    pub frame_rate: Option<Rational>,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u16,
    #[serde(default)]
    pub sample_format: Option<SampleFormat>,
}

impl CodecParameters {
    pub fn video(codec: &str, width: u32, height: u32, frame_rate: Rational) -> Self {
        Self {
            codec: codec.to_string(),
            kind: MediaKind::Video,
            width,
            height,
            pixel_format: Some(PixelFormat::Yuv420p),
            frame_rate: Some(frame_rate),
            sample_rate: 0,
            channels: 0,
            sample_format: None,
        }
    }

    pub fn audio(codec: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec: codec.to_string(),
            kind: MediaKind::Audio,
            width: 0,
            height: 0,
            pixel_format: None,
            frame_rate: None,
            sample_rate,
            channels,
            sample_format: Some(SampleFormat::F32p),
        }
    }
}

/// One stream of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputStream {
    pub index: usize,
    pub time_base: Rational,
    pub params: CodecParameters,
}

/// Stream layout of the source, owned by the decode stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    pub streams: Vec<InputStream>,
}

impl InputContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stream; its index is its position.
    pub fn with_stream(mut self, time_base: Rational, params: CodecParameters) -> Self {
        let index = self.streams.len();
        self.streams.push(InputStream {
            index,
            time_base,
            params,
        });
        self
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, index: usize) -> Option<&InputStream> {
        self.streams.get(index)
    }

    /// First stream of the given kind.
    pub fn best_stream(&self, kind: MediaKind) -> Option<&InputStream> {
        self.streams.iter().find(|s| s.params.kind == kind)
    }
}

/// What the filter graph feeding one output stream produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterContext {
    pub format: FrameFormat,
    /// Time base of the frame timestamps leaving the filter.
    pub time_base: Rational,
}

impl FilterContext {
    pub fn new(format: FrameFormat, time_base: Rational) -> Self {
        Self { format, time_base }
    }

    pub fn video(width: u32, height: u32, pixel_format: PixelFormat, time_base: Rational) -> Self {
        Self::new(
            FrameFormat::Video {
                width,
                height,
                pixel_format,
            },
            time_base,
        )
    }

    pub fn audio(
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
        time_base: Rational,
    ) -> Self {
        Self::new(
            FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format,
            },
            time_base,
        )
    }
}
