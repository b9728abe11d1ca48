//! Output configuration: which input streams to encode, with which encoders,
//! and how the muxer treats ordering violations and write failures.

use crate::error::Result;
use crate::media::Rational;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// What the muxer does with a packet whose timestamp is not past the stream
/// watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonotonicPolicy {
    /// Discard the late packet.
    #[default]
    Drop,
    /// Move the packet to `last + 1` in stream time base units.
    Clamp,
}

/// Scope of a container write failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteErrorPolicy {
    /// Report the failure and change nothing; the caller retries or aborts.
    #[default]
    Propagate,
    /// Stop writing the failed stream, keep writing its siblings.
    AbortStream,
    /// Fail every later write of this output.
    AbortOutput,
}

/// Hardware acceleration device for an encoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// FFmpeg hardware device type name: "cuda", "vaapi", "qsv", "videotoolbox".
    pub device_type: String,
    /// Device path or ordinal, device type specific.
    #[serde(default)]
    pub device: Option<String>,
}

impl HardwareConfig {
    pub fn new(device_type: &str) -> Self {
        Self {
            device_type: device_type.to_string(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }
}

/// Encoder settings for one output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Encoder name, e.g. "libx264", "h264_nvenc", "aac".
    pub codec: String,
    #[serde(default)]
    pub bitrate: Option<u64>,
    /// Output size; defaults to the input stream's size.
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Output frame rate; defaults to the input stream's rate.
    #[serde(default)]
    pub frame_rate: Option<Rational>,
    /// Keyframe interval in seconds.
    #[serde(default)]
    pub gop_seconds: Option<f64>,
    /// Encoder time base; defaults to 1/fps for video, 1/sample_rate for audio.
    #[serde(default)]
    pub time_base: Option<Rational>,
    #[serde(default)]
    pub hardware: Option<HardwareConfig>,
    /// Private encoder options passed through to the codec.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl EncoderConfig {
    pub fn new(codec: &str) -> Self {
        Self {
            codec: codec.to_string(),
            bitrate: None,
            width: None,
            height: None,
            frame_rate: None,
            gop_seconds: None,
            time_base: None,
            hardware: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_time_base(mut self, time_base: Rational) -> Self {
        self.time_base = Some(time_base);
        self
    }

    pub fn with_hardware(mut self, hardware: HardwareConfig) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }
}

/// One output stream fed from one input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub input_index: usize,
    pub encoder: EncoderConfig,
}

/// Configuration of one output target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination path or URL.
    pub target: String,
    /// Container format name; guessed from the target when absent.
    #[serde(default)]
    pub format: Option<String>,
    pub streams: Vec<StreamConfig>,
    /// Options for the container muxer.
    #[serde(default)]
    pub muxer_options: BTreeMap<String, String>,
    #[serde(default)]
    pub monotonic_policy: MonotonicPolicy,
    #[serde(default)]
    pub write_error_policy: WriteErrorPolicy,
}

impl OutputConfig {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            format: None,
            streams: Vec::new(),
            muxer_options: BTreeMap::new(),
            monotonic_policy: MonotonicPolicy::default(),
            write_error_policy: WriteErrorPolicy::default(),
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    pub fn with_stream(mut self, input_index: usize, encoder: EncoderConfig) -> Self {
        self.streams.push(StreamConfig {
            input_index,
            encoder,
        });
        self
    }

    pub fn with_muxer_option(mut self, key: &str, value: &str) -> Self {
        self.muxer_options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_monotonic_policy(mut self, policy: MonotonicPolicy) -> Self {
        self.monotonic_policy = policy;
        self
    }

    pub fn with_write_error_policy(mut self, policy: WriteErrorPolicy) -> Self {
        self.write_error_policy = policy;
        self
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            crate::OutputError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Format name, explicit or derived from the target extension.
    pub fn format_name(&self) -> Option<String> {
        if let Some(format) = &self.format {
            return Some(format.clone());
        }
        let ext = Path::new(&self.target).extension()?.to_str()?.to_ascii_lowercase();
        let name = match ext.as_str() {
            "ts" => "mpegts",
            "m3u8" => "hls",
            "mkv" => "matroska",
            other => other,
        };
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_config_from_json() {
        let json = r#"{
            "target": "out.ts",
            "streams": [
                {
                    "input_index": 0,
                    "encoder": {
                        "codec": "h264_nvenc",
                        "bitrate": 4000000,
                        "width": 1280,
                        "height": 720,
                        "hardware": { "device_type": "cuda", "device": "0" },
                        "options": { "preset": "p4" }
                    }
                },
                { "input_index": 1, "encoder": { "codec": "aac" } }
            ],
            "monotonic_policy": "clamp",
            "write_error_policy": "abort_stream"
        }"#;

        let config = OutputConfig::from_json(json).unwrap();
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.monotonic_policy, MonotonicPolicy::Clamp);
        assert_eq!(config.write_error_policy, WriteErrorPolicy::AbortStream);

        let video = &config.streams[0].encoder;
        assert_eq!(video.codec, "h264_nvenc");
        assert_eq!(video.width, Some(1280));
        assert_eq!(
            video.hardware,
            Some(HardwareConfig::new("cuda").with_device("0"))
        );
        assert_eq!(video.options.get("preset").map(String::as_str), Some("p4"));

        let audio = &config.streams[1].encoder;
        assert_eq!(audio.bitrate, None);
        assert!(audio.hardware.is_none());
    }

    #[test]
    fn test_output_config_defaults() {
        let config = OutputConfig::from_json(r#"{"target": "a.mp4", "streams": []}"#).unwrap();
        assert_eq!(config.monotonic_policy, MonotonicPolicy::Drop);
        assert_eq!(config.write_error_policy, WriteErrorPolicy::Propagate);
        assert!(config.muxer_options.is_empty());
    }

    #[test]
    fn test_output_config_rejects_malformed_json() {
        let err = OutputConfig::from_json(r#"{"target": 3}"#).unwrap_err();
        assert!(matches!(err, crate::OutputError::Configuration(_)));
    }

    #[test]
    fn test_format_name() {
        assert_eq!(OutputConfig::new("seg.ts").format_name().as_deref(), Some("mpegts"));
        assert_eq!(OutputConfig::new("movie.MP4").format_name().as_deref(), Some("mp4"));
        assert_eq!(
            OutputConfig::new("movie.mp4").with_format("mov").format_name().as_deref(),
            Some("mov")
        );
        assert_eq!(OutputConfig::new("pipe").format_name(), None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("output.json");
        std::fs::write(&path, r#"{"target": "x.ts", "streams": []}"#).unwrap();
        let config = OutputConfig::load(&path).unwrap();
        assert_eq!(config.target, "x.ts");

        assert!(OutputConfig::load(dir.path().join("missing.json")).is_err());
    }
}
