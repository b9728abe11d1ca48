//! Output context manager: allocates the encoders and container of one
//! output target and tears them down under a [`ClosePolicy`].

use super::config::{EncoderConfig, OutputConfig};
use super::encoder::{EncoderState, StreamEncoder};
use super::muxer::{Muxer, StreamDescriptor};
use super::stats::OutputStats;
use crate::codec::{CodecBackend, Encode, EncoderParams};
use crate::error::{OutputError, Result};
use crate::media::{
    FrameFormat, InputContext, InputStream, MediaKind, PixelFormat, Rational, SampleFormat,
};
use crate::pipeline::OutputQueue;

/// What happens to encoder handles when an output context closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Destroy every encoder, hardware included.
    #[default]
    ForceClose,
    /// Keep cleanly flushed hardware encoders alive for the next output.
    PreserveHardware,
}

/// Hardware encoders detached from a closed output context, ready to be
/// reattached by [`OutputContext::open`].
///
/// Dropping the token destroys the encoders it holds.
#[derive(Default)]
pub struct HardwareEncoders {
    encoders: Vec<(Box<dyn Encode>, EncoderParams)>,
}

impl HardwareEncoders {
    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }

    /// Codec names of the held encoders.
    pub fn codecs(&self) -> Vec<&str> {
        self.encoders.iter().map(|(handle, _)| handle.name()).collect()
    }

    fn push(&mut self, handle: Box<dyn Encode>, params: EncoderParams) {
        self.encoders.push((handle, params));
    }

    /// Remove the first encoder that can serve `params` unchanged.
    fn take_compatible(
        &mut self,
        params: &EncoderParams,
    ) -> Option<(Box<dyn Encode>, EncoderParams)> {
        let position = self
            .encoders
            .iter()
            .position(|(_, held)| held.is_compatible(params))?;
        Some(self.encoders.remove(position))
    }

    /// Destroy every held encoder.
    fn clear(&mut self) {
        if !self.encoders.is_empty() {
            log::info!(
                "Destroying {} preserved hardware encoder(s): {}",
                self.encoders.len(),
                self.codecs().join(", ")
            );
            self.encoders.clear();
        }
    }
}

impl std::fmt::Debug for HardwareEncoders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareEncoders")
            .field("codecs", &self.codecs())
            .finish()
    }
}

impl Drop for HardwareEncoders {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Everything one output target needs while transcoding.
pub struct OutputContext {
    target: String,
    /// Input stream feeding each output stream.
    inputs: Vec<usize>,
    encoders: Vec<StreamEncoder>,
    muxer: Muxer,
    queue: OutputQueue,
    closed: bool,
    /// Statistics frozen at close, once the encoders are gone.
    final_stats: Option<OutputStats>,
}

impl OutputContext {
    /// Allocate encoders and container for `config`.
    ///
    /// Encoders compatible with a handle in `preserved` reuse it without
    /// touching the backend; preserved handles nobody needs are destroyed
    /// before anything new is allocated. If opening fails, the reused handles
    /// are put back into `preserved`.
    pub fn open(
        input: &InputContext,
        config: &OutputConfig,
        backend: &dyn CodecBackend,
        queue: OutputQueue,
        preserved: Option<&mut HardwareEncoders>,
    ) -> Result<Self> {
        if config.streams.is_empty() {
            return Err(OutputError::configuration(format!(
                "output {} has no streams",
                config.target
            )));
        }
        let format = config.format_name().ok_or_else(|| {
            OutputError::configuration(format!(
                "cannot determine container format of {}",
                config.target
            ))
        })?;

        let mut resolved = Vec::with_capacity(config.streams.len());
        for (index, stream) in config.streams.iter().enumerate() {
            let source = input.stream(stream.input_index).ok_or_else(|| {
                OutputError::configuration(format!(
                    "output stream {} selects input stream {}, input has {}",
                    index,
                    stream.input_index,
                    input.stream_count()
                ))
            })?;
            resolved.push(resolve_params(index, source, &stream.encoder)?);
        }

        let mut unused = HardwareEncoders::default();
        let preserved = preserved.unwrap_or(&mut unused);
        let mut reattached: Vec<_> = resolved
            .iter()
            .map(|params| {
                if params.is_hardware() {
                    preserved.take_compatible(params)
                } else {
                    None
                }
            })
            .collect();
        preserved.clear();

        let mut encoders = Vec::with_capacity(resolved.len());
        let mut failure = None;
        for (index, params) in resolved.into_iter().enumerate() {
            if let Some((handle, held)) = reattached[index].take() {
                log::info!(
                    "Reattaching preserved {} encoder to stream {} of {}",
                    handle.name(),
                    index,
                    config.target
                );
                encoders.push(StreamEncoder::new(handle, held, true));
                continue;
            }
            match backend.open_encoder(&params) {
                Ok(handle) => encoders.push(StreamEncoder::new(handle, params, false)),
                Err(e) => {
                    log::warn!(
                        "Cannot open {} encoder for stream {} of {}: {}",
                        params.codec,
                        index,
                        config.target,
                        e
                    );
                    failure = Some(OutputError::from_open(e));
                    break;
                }
            }
        }

        let opened = match failure {
            Some(err) => Err(err),
            None => open_muxer(config, backend, &encoders),
        };
        let muxer = match opened {
            Ok(muxer) => muxer,
            Err(err) => {
                // hand the reused sessions back untouched
                for encoder in encoders.into_iter().filter(StreamEncoder::was_reused) {
                    let (handle, params) = encoder.into_parts();
                    preserved.push(handle, params);
                }
                for (handle, params) in reattached.into_iter().flatten() {
                    preserved.push(handle, params);
                }
                return Err(err);
            }
        };

        log::info!(
            "Opened output {} ({}) with {} stream(s)",
            config.target,
            format,
            encoders.len()
        );

        Ok(Self {
            target: config.target.clone(),
            inputs: config.streams.iter().map(|s| s.input_index).collect(),
            encoders,
            muxer,
            queue,
            closed: false,
            final_stats: None,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn stream_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    pub fn muxer(&self) -> &Muxer {
        &self.muxer
    }

    pub fn encoder(&self, stream: usize) -> Option<&StreamEncoder> {
        self.encoders.get(stream)
    }

    pub fn encoder_state(&self, stream: usize) -> Option<EncoderState> {
        self.encoder(stream).map(StreamEncoder::state)
    }

    /// Input stream index feeding output `stream`.
    pub fn input_index(&self, stream: usize) -> Result<usize> {
        self.ensure_open()?;
        self.inputs.get(stream).copied().ok_or_else(|| {
            OutputError::configuration(format!("{} has no output stream {}", self.target, stream))
        })
    }

    pub(crate) fn muxer_mut(&mut self) -> Result<&mut Muxer> {
        self.ensure_open()?;
        Ok(&mut self.muxer)
    }

    pub(crate) fn encoder_and_muxer(
        &mut self,
        stream: usize,
    ) -> Result<(&mut StreamEncoder, &mut Muxer)> {
        self.ensure_open()?;
        let target = &self.target;
        let encoder = self.encoders.get_mut(stream).ok_or_else(|| {
            OutputError::configuration(format!("{} has no output stream {}", target, stream))
        })?;
        Ok((encoder, &mut self.muxer))
    }

    /// Continue every stream's timestamps after what was already written.
    pub fn mark_discontinuity(&mut self) {
        log::info!("Discontinuity on {}", self.target);
        self.muxer.mark_discontinuity();
    }

    pub fn stats(&self) -> OutputStats {
        if let Some(stats) = self.final_stats {
            return stats;
        }

        let mux = self.muxer.counters();
        let mut stats = OutputStats {
            video_packets: mux.video_packets,
            audio_packets: mux.audio_packets,
            dropped_packets: mux.dropped_packets,
            clamped_packets: mux.clamped_packets,
            discarded_packets: mux.discarded_packets,
            ..Default::default()
        };
        for encoder in &self.encoders {
            match encoder.params().kind() {
                MediaKind::Video => stats.video_frames += encoder.frames(),
                MediaKind::Audio => stats.audio_frames += encoder.frames(),
            }
            stats.pixels += encoder.pixels();
        }
        stats
    }

    /// Flush every encoder, draining all packets into the container.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        for (stream, encoder) in self.encoders.iter_mut().enumerate() {
            encoder.flush(&mut self.muxer, stream)?;
        }
        Ok(())
    }

    /// Flush what is left, finalise the container and release the encoders
    /// under `policy`.
    ///
    /// Never fails: errors are logged and teardown continues. Returns the
    /// preserved hardware encoders, if any. Closing twice does nothing.
    pub fn close(&mut self, policy: ClosePolicy) -> Option<HardwareEncoders> {
        if self.closed {
            log::debug!("Output {} already closed", self.target);
            return None;
        }

        for (stream, encoder) in self.encoders.iter_mut().enumerate() {
            if encoder.state() == EncoderState::Flushed {
                continue;
            }
            if let Err(e) = encoder.flush(&mut self.muxer, stream) {
                log::warn!(
                    "Flush of stream {} of {} failed during close: {}",
                    stream,
                    self.target,
                    e
                );
            }
        }
        if let Err(e) = self.muxer.finish() {
            log::warn!("Cannot finalise {}: {}", self.target, e);
        }

        self.final_stats = Some(self.stats());
        self.closed = true;

        let mut preserved = HardwareEncoders::default();
        for (stream, mut encoder) in self.encoders.drain(..).enumerate() {
            if policy != ClosePolicy::PreserveHardware || !encoder.is_hardware() {
                continue;
            }
            match encoder.reset() {
                Ok(()) => {
                    log::info!(
                        "Preserving {} encoder of stream {} of {}",
                        encoder.name(),
                        stream,
                        self.target
                    );
                    let (handle, params) = encoder.into_parts();
                    preserved.push(handle, params);
                }
                Err(e) => log::warn!(
                    "Destroying hardware encoder of stream {} of {}: {}",
                    stream,
                    self.target,
                    e
                ),
            }
        }

        log::info!("Closed output {} ({})", self.target, self.stats());
        if preserved.is_empty() {
            None
        } else {
            Some(preserved)
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(OutputError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for OutputContext {
    fn drop(&mut self) {
        if !self.closed {
            log::debug!("Output {} dropped while open, force closing", self.target);
            self.close(ClosePolicy::ForceClose);
        }
    }
}

impl std::fmt::Debug for OutputContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputContext")
            .field("target", &self.target)
            .field("encoders", &self.encoders)
            .field("muxer", &self.muxer)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Open the container for `encoders` and read back the stream time bases.
fn open_muxer(
    config: &OutputConfig,
    backend: &dyn CodecBackend,
    encoders: &[StreamEncoder],
) -> Result<Muxer> {
    let stream_params: Vec<_> = encoders.iter().map(|e| e.handle().stream_params()).collect();
    let container = backend
        .open_container(config, &stream_params)
        .map_err(OutputError::from_open)?;

    let mut descriptors = Vec::with_capacity(encoders.len());
    for (index, encoder) in encoders.iter().enumerate() {
        let time_base = container
            .stream_time_base(index)
            .filter(|tb| tb.is_valid())
            .ok_or_else(|| {
                OutputError::resource(format!(
                    "{} did not declare a usable stream {}",
                    config.target, index
                ))
            })?;
        descriptors.push(StreamDescriptor {
            index,
            kind: encoder.params().kind(),
            time_base,
        });
    }

    Ok(Muxer::new(
        container,
        descriptors,
        config.monotonic_policy,
        config.write_error_policy,
    ))
}

/// Fill in everything the encoder config leaves to the source stream.
fn resolve_params(
    index: usize,
    source: &InputStream,
    config: &EncoderConfig,
) -> Result<EncoderParams> {
    let invalid = |what: String| {
        OutputError::configuration(format!("output stream {}: {}", index, what))
    };

    let (format, frame_rate, default_time_base, gop_size) = match source.params.kind {
        MediaKind::Video => {
            let width = config.width.unwrap_or(source.params.width);
            let height = config.height.unwrap_or(source.params.height);
            if width == 0 || height == 0 {
                return Err(invalid(format!("invalid frame size {}x{}", width, height)));
            }
            let frame_rate = config
                .frame_rate
                .or(source.params.frame_rate)
                .filter(|rate| rate.is_valid())
                .ok_or_else(|| invalid("no usable frame rate".to_string()))?;
            let gop_size = config
                .gop_seconds
                .map(|seconds| (seconds * frame_rate.to_f64()).round().max(1.0) as u32);
            let format = FrameFormat::Video {
                width,
                height,
                pixel_format: source.params.pixel_format.unwrap_or(PixelFormat::Yuv420p),
            };
            (format, Some(frame_rate), frame_rate.invert(), gop_size)
        }
        MediaKind::Audio => {
            if config.hardware.is_some() {
                return Err(invalid("hardware encoding applies to video only".to_string()));
            }
            let sample_rate = source.params.sample_rate;
            if sample_rate == 0 || sample_rate > i32::MAX as u32 || source.params.channels == 0 {
                return Err(invalid(format!(
                    "invalid audio layout {} Hz, {} channel(s)",
                    sample_rate, source.params.channels
                )));
            }
            let format = FrameFormat::Audio {
                sample_rate,
                channels: source.params.channels,
                sample_format: source.params.sample_format.unwrap_or(SampleFormat::F32p),
            };
            (format, None, Rational::new(1, sample_rate as i32), None)
        }
    };

    let time_base = config.time_base.unwrap_or(default_time_base);
    if !time_base.is_valid() {
        return Err(invalid(format!("invalid time base {}", time_base)));
    }

    Ok(EncoderParams {
        codec: config.codec.clone(),
        format,
        frame_rate,
        time_base,
        bitrate: config.bitrate,
        gop_size,
        hardware: config.hardware.clone(),
        options: config.options.clone(),
    })
}
