//! Raw frames and compressed packets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
        }
    }
}

/// Pixel layouts accepted by the encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Yuv444p,
    Rgba,
    Bgra,
}

impl PixelFormat {
    /// Size in bytes of one picture at the given dimensions.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            PixelFormat::Yuv444p => w * h * 3,
            PixelFormat::Rgba | PixelFormat::Bgra => w * h * 4,
        }
    }
}

/// Audio sample layouts accepted by the encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    S16,
    S16p,
    F32,
    F32p,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::F32 | SampleFormat::F32p => 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::S16p | SampleFormat::F32p)
    }
}

/// Format and geometry of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameFormat {
    Video {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
    },
}

impl FrameFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            FrameFormat::Video { .. } => MediaKind::Video,
            FrameFormat::Audio { .. } => MediaKind::Audio,
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Video {
                width,
                height,
                pixel_format,
            } => write!(f, "{}x{} {:?}", width, height, pixel_format),
            FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format,
            } => write!(f, "{} Hz {}ch {:?}", sample_rate, channels, sample_format),
        }
    }
}

/// A decoded and filtered unit of media.
///
/// `pts` is expressed in the time base of the filter that produced the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub format: FrameFormat,
    pub pts: Option<i64>,
    /// Audio samples per channel. Zero for video.
    pub nb_samples: u32,
    /// Pixel planes or samples, tightly packed in plane order.
    pub data: Vec<u8>,
}

impl Frame {
    /// A zero-filled video frame.
    pub fn video(width: u32, height: u32, pixel_format: PixelFormat, pts: i64) -> Self {
        Self {
            format: FrameFormat::Video {
                width,
                height,
                pixel_format,
            },
            pts: Some(pts),
            nb_samples: 0,
            data: vec![0; pixel_format.frame_size(width, height)],
        }
    }

    /// A silent audio frame.
    pub fn audio(
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
        nb_samples: u32,
        pts: i64,
    ) -> Self {
        let size = nb_samples as usize * channels as usize * sample_format.bytes_per_sample();
        Self {
            format: FrameFormat::Audio {
                sample_rate,
                channels,
                sample_format,
            },
            pts: Some(pts),
            nb_samples,
            data: vec![0; size],
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    /// Pixel count for video frames, zero for audio.
    pub fn pixels(&self) -> u64 {
        match self.format {
            FrameFormat::Video { width, height, .. } => width as u64 * height as u64,
            FrameFormat::Audio { .. } => 0,
        }
    }
}

/// A compressed unit emitted by an encoder.
///
/// Timestamps are in the encoder's time base until the muxer rescales them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_keyframe: bool,
    /// Output stream index, assigned by the muxer.
    pub stream_index: usize,
}

impl Packet {
    pub fn new(data: Vec<u8>, pts: Option<i64>, dts: Option<i64>, duration: i64) -> Self {
        Self {
            data,
            pts,
            dts,
            duration,
            is_keyframe: false,
            stream_index: 0,
        }
    }

    pub fn with_keyframe(mut self, is_keyframe: bool) -> Self {
        self.is_keyframe = is_keyframe;
        self
    }

    /// Timestamp used for ordering: pts, falling back to dts.
    pub fn order_ts(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}
