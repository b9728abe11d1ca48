//! Encoder driver: submits frames, drains every packet the encoder has ready
//! into the muxer, and flushes at end of stream.
//!
//! Per encoder the states run `Open -> Encoding -> Flushing -> Flushed`.
//! A hardware encoder carried over from a previous output re-enters `Open`.

use super::context::OutputContext;
use super::muxer::Muxer;
use crate::codec::{CodecError, Encode, EncoderParams, ReceiveOutcome};
use crate::error::{OutputError, Result};
use crate::media::{FilterContext, Frame, FrameFormat, InputContext, Packet, Rational};

/// Upper bound on packets drained after a single submission.
pub const DRAIN_LIMIT: usize = 1 << 16;

/// Lifecycle of an encoder within one output context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    /// Allocated or reattached, nothing submitted yet.
    Open,
    /// Accepting frames.
    Encoding,
    /// End of stream submitted, packets may remain.
    Flushing,
    /// Every packet retrieved. Terminal.
    Flushed,
}

/// An encoder handle bound to one output stream.
pub struct StreamEncoder {
    handle: Box<dyn Encode>,
    params: EncoderParams,
    state: EncoderState,
    /// Packet whose write failed, written first on the next call.
    pending: Option<Packet>,
    frames: u64,
    pixels: u64,
    reused: bool,
}

impl StreamEncoder {
    pub(crate) fn new(handle: Box<dyn Encode>, params: EncoderParams, reused: bool) -> Self {
        Self {
            handle,
            params,
            state: EncoderState::Open,
            pending: None,
            frames: 0,
            pixels: 0,
            reused,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn time_base(&self) -> Rational {
        self.handle.time_base()
    }

    pub fn is_hardware(&self) -> bool {
        self.handle.is_hardware()
    }

    /// Whether the handle came from a preserved hardware encoder.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn pixels(&self) -> u64 {
        self.pixels
    }

    pub fn has_pending_packet(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn handle(&self) -> &dyn Encode {
        self.handle.as_ref()
    }

    /// Give up the handle, e.g. to hand it to another output context.
    pub(crate) fn into_parts(self) -> (Box<dyn Encode>, EncoderParams) {
        (self.handle, self.params)
    }

    /// Submit `frame` (or end of stream when `None`) and mux everything the
    /// encoder produces in response.
    pub(crate) fn submit(
        &mut self,
        muxer: &mut Muxer,
        stream: usize,
        filter: &FilterContext,
        frame: Option<&Frame>,
    ) -> Result<()> {
        let Some(frame) = frame else {
            return self.flush(muxer, stream);
        };

        if matches!(self.state, EncoderState::Flushing | EncoderState::Flushed) {
            return Err(OutputError::Encode {
                stream,
                source: CodecError::Fault(format!(
                    "{}: frame submitted after end of stream",
                    self.handle.name()
                )),
            });
        }
        check_frame(stream, frame, filter, &self.params)?;

        muxer.check_output(stream)?;
        self.write_pending(muxer, stream)?;

        let pts = frame
            .pts
            .map(|pts| Rational::rescale(pts, filter.time_base, self.handle.time_base()));
        self.handle
            .send_frame(frame, pts)
            .map_err(|source| OutputError::Encode { stream, source })?;

        self.state = EncoderState::Encoding;
        self.frames += 1;
        self.pixels += frame.pixels();

        // The frame is consumed. A failed write stays pending and is reported
        // by the next call, before that call submits anything.
        match self.drain(muxer, stream) {
            Err(err) if err.is_transient() => {
                log::warn!("Keeping packet of stream {} for retry: {}", stream, err);
                Ok(())
            }
            other => other,
        }
    }

    /// Submit end of stream and drain the remaining packets.
    ///
    /// Calling it again once `Flushed` does nothing. A flush interrupted by a
    /// write failure resumes where it stopped.
    pub(crate) fn flush(&mut self, muxer: &mut Muxer, stream: usize) -> Result<()> {
        match self.state {
            EncoderState::Flushed => return Ok(()),
            EncoderState::Flushing => {}
            EncoderState::Open | EncoderState::Encoding => {
                self.write_pending(muxer, stream)?;
                self.handle
                    .send_eof()
                    .map_err(|source| OutputError::Encode { stream, source })?;
                self.state = EncoderState::Flushing;
            }
        }

        self.write_pending(muxer, stream)?;
        self.drain(muxer, stream)
    }

    /// Make a flushed encoder accept frames again without reinitialising it.
    pub(crate) fn reset(&mut self) -> std::result::Result<(), CodecError> {
        if self.state != EncoderState::Flushed {
            return Err(CodecError::Fault(format!(
                "{}: reset requested in state {:?}",
                self.handle.name(),
                self.state
            )));
        }
        self.handle.reset()?;
        self.state = EncoderState::Open;
        Ok(())
    }

    fn drain(&mut self, muxer: &mut Muxer, stream: usize) -> Result<()> {
        for _ in 0..DRAIN_LIMIT {
            let outcome = self
                .handle
                .receive_packet()
                .map_err(|source| OutputError::Encode { stream, source })?;

            match outcome {
                ReceiveOutcome::Packet(packet) => self.emit(muxer, stream, packet)?,
                ReceiveOutcome::Again => {
                    if self.state == EncoderState::Flushing {
                        log::debug!(
                            "Encoder {} has nothing ready while flushing stream {}",
                            self.handle.name(),
                            stream
                        );
                    }
                    return Ok(());
                }
                ReceiveOutcome::Flushed => {
                    if self.state == EncoderState::Flushing {
                        self.state = EncoderState::Flushed;
                    }
                    return Ok(());
                }
            }
        }

        Err(OutputError::Encode {
            stream,
            source: CodecError::Fault(format!(
                "{}: more than {} packets from one submission",
                self.handle.name(),
                DRAIN_LIMIT
            )),
        })
    }

    fn emit(&mut self, muxer: &mut Muxer, stream: usize, packet: Packet) -> Result<()> {
        match muxer.write(packet.clone(), self.handle.time_base(), stream) {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.is_transient() {
                    self.pending = Some(packet);
                }
                Err(err)
            }
        }
    }

    fn write_pending(&mut self, muxer: &mut Muxer, stream: usize) -> Result<()> {
        match self.pending.take() {
            Some(packet) => self.emit(muxer, stream, packet),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StreamEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEncoder")
            .field("name", &self.handle.name())
            .field("hardware", &self.handle.is_hardware())
            .field("state", &self.state)
            .field("frames", &self.frames)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

fn check_frame(
    stream: usize,
    frame: &Frame,
    filter: &FilterContext,
    params: &EncoderParams,
) -> Result<()> {
    let mismatch = |message: String| OutputError::FilterMismatch { stream, message };

    if filter.format != params.format {
        return Err(mismatch(format!(
            "filter produces {} but encoder expects {}",
            filter.format, params.format
        )));
    }
    if frame.format != filter.format {
        return Err(mismatch(format!(
            "frame is {} but filter declares {}",
            frame.format, filter.format
        )));
    }

    let needed = match frame.format {
        FrameFormat::Video {
            width,
            height,
            pixel_format,
        } => pixel_format.frame_size(width, height),
        FrameFormat::Audio {
            channels,
            sample_format,
            ..
        } => {
            if frame.nb_samples == 0 {
                return Err(mismatch("audio frame without samples".to_string()));
            }
            frame.nb_samples as usize * channels as usize * sample_format.bytes_per_sample()
        }
    };
    if frame.data.len() < needed {
        return Err(mismatch(format!(
            "frame holds {} bytes, {} needed",
            frame.data.len(),
            needed
        )));
    }
    Ok(())
}

/// Submit `frame` to the encoder of output `stream` and mux every packet it
/// produces. `None` flushes the encoder.
///
/// A [`OutputError::Write`] means `frame` was not submitted and may be passed
/// again. When a write fails after the encoder took the frame, the packet is
/// kept and written first by the next call; that call fails instead if the
/// container still refuses it.
///
/// `input` must be the context the output was opened from; the filter has to
/// produce the media kind of the stream's source.
pub fn process(
    input: &InputContext,
    output: &mut OutputContext,
    stream: usize,
    filter: &FilterContext,
    frame: Option<&Frame>,
) -> Result<()> {
    let input_index = output.input_index(stream)?;
    let source = input.stream(input_index).ok_or_else(|| {
        OutputError::configuration(format!(
            "output stream {} reads missing input stream {}",
            stream, input_index
        ))
    })?;
    if source.params.kind != filter.format.kind() {
        return Err(OutputError::FilterMismatch {
            stream,
            message: format!(
                "filter produces {} for {} input stream {}",
                filter.format.kind(),
                source.params.kind,
                input_index
            ),
        });
    }

    let (encoder, muxer) = output.encoder_and_muxer(stream)?;
    encoder.submit(muxer, stream, filter, frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecBackend, MemoryBackend, MemorySink};
    use crate::media::PixelFormat;
    use crate::output::{MonotonicPolicy, OutputConfig, StreamDescriptor, WriteErrorPolicy};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const FPS: Rational = Rational::new(25, 1);

    fn params() -> EncoderParams {
        EncoderParams {
            codec: "libx264".to_string(),
            format: FrameFormat::Video {
                width: 32,
                height: 18,
                pixel_format: PixelFormat::Yuv420p,
            },
            frame_rate: Some(FPS),
            time_base: FPS.invert(),
            bitrate: None,
            gop_size: None,
            hardware: None,
            options: BTreeMap::new(),
        }
    }

    fn filter() -> FilterContext {
        FilterContext::video(32, 18, PixelFormat::Yuv420p, Rational::MILLIS)
    }

    fn setup(delay: usize) -> (StreamEncoder, Muxer, Arc<MemorySink>) {
        let backend = MemoryBackend::new().with_delay(delay);
        let handle = backend.open_encoder(&params()).unwrap();
        let container = backend
            .open_container(&OutputConfig::new("enc.ts"), &[handle.stream_params()])
            .unwrap();
        let muxer = Muxer::new(
            container,
            vec![StreamDescriptor {
                index: 0,
                kind: crate::media::MediaKind::Video,
                time_base: Rational::MPEG_TS,
            }],
            MonotonicPolicy::Drop,
            WriteErrorPolicy::Propagate,
        );
        let sink = backend.sink("enc.ts").unwrap();
        (StreamEncoder::new(handle, params(), false), muxer, sink)
    }

    fn frame(pts: i64) -> Frame {
        Frame::video(32, 18, PixelFormat::Yuv420p, pts)
    }

    #[test]
    fn test_state_machine() {
        let (mut encoder, mut muxer, sink) = setup(1);
        assert_eq!(encoder.state(), EncoderState::Open);

        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
        assert_eq!(encoder.state(), EncoderState::Encoding);
        assert!(sink.packets().is_empty(), "first frame is buffered");

        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(40))).unwrap();
        assert_eq!(sink.packets().len(), 1);

        encoder.submit(&mut muxer, 0, &filter(), None).unwrap();
        assert_eq!(encoder.state(), EncoderState::Flushed);
        assert_eq!(sink.packets().len(), 2);
    }

    #[test]
    fn test_frame_pts_rescaled_into_encoder_time_base() {
        let (mut encoder, mut muxer, sink) = setup(0);
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(80))).unwrap();
        // 80 ms is frame 2 at 25 fps, which is 7200 at 90 kHz
        assert_eq!(sink.packets()[0].pts, Some(7200));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let (mut encoder, mut muxer, sink) = setup(3);
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
        encoder.flush(&mut muxer, 0).unwrap();
        let written = sink.packets().len();

        encoder.flush(&mut muxer, 0).unwrap();
        assert_eq!(sink.packets().len(), written);
        assert_eq!(encoder.state(), EncoderState::Flushed);
    }

    #[test]
    fn test_frame_after_flush_is_encode_error() {
        let (mut encoder, mut muxer, _sink) = setup(0);
        encoder.flush(&mut muxer, 0).unwrap();
        let err = encoder
            .submit(&mut muxer, 0, &filter(), Some(&frame(0)))
            .unwrap_err();
        assert!(matches!(err, OutputError::Encode { stream: 0, .. }));
    }

    #[test]
    fn test_filter_mismatch() {
        let (mut encoder, mut muxer, _sink) = setup(0);
        let wrong = Frame::video(16, 18, PixelFormat::Yuv420p, 0);
        let err = encoder
            .submit(&mut muxer, 0, &filter(), Some(&wrong))
            .unwrap_err();
        assert!(matches!(err, OutputError::FilterMismatch { .. }));

        let mut short = frame(0);
        short.data.truncate(10);
        let err = encoder
            .submit(&mut muxer, 0, &filter(), Some(&short))
            .unwrap_err();
        assert!(err.to_string().contains("bytes"));

        let other_filter = FilterContext::video(64, 36, PixelFormat::Yuv420p, Rational::MILLIS);
        let big = Frame::video(64, 36, PixelFormat::Yuv420p, 0);
        assert!(matches!(
            encoder.submit(&mut muxer, 0, &other_filter, Some(&big)),
            Err(OutputError::FilterMismatch { .. })
        ));
        assert_eq!(encoder.state(), EncoderState::Open);
        assert_eq!(encoder.frames(), 0);
    }

    #[test]
    fn test_write_failure_keeps_packet_for_retry() {
        let (mut encoder, mut muxer, sink) = setup(0);
        sink.fail_next_writes(1);

        // accepted by the encoder, so the failed write is deferred
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
        assert_eq!(encoder.frames(), 1);
        assert!(encoder.has_pending_packet());
        assert!(sink.packets().is_empty());

        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(40))).unwrap();
        let pts: Vec<_> = sink.packets().iter().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, [0, 3600]);
        assert!(!encoder.has_pending_packet());
    }

    #[test]
    fn test_write_error_means_frame_not_submitted() {
        let (mut encoder, mut muxer, sink) = setup(0);
        sink.fail_next_writes(2);

        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
        let err = encoder
            .submit(&mut muxer, 0, &filter(), Some(&frame(40)))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(encoder.frames(), 1, "frame 40 was not handed to the encoder");

        // the same frame goes again, nothing lost or duplicated
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(40))).unwrap();
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(80))).unwrap();
        let pts: Vec<_> = sink.packets().iter().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, [0, 3600, 7200]);
        assert_eq!(encoder.frames(), 3);
    }

    #[test]
    fn test_interrupted_flush_resumes() {
        let (mut encoder, mut muxer, sink) = setup(5);
        for pts in [0, 40, 80] {
            encoder.submit(&mut muxer, 0, &filter(), Some(&frame(pts))).unwrap();
        }
        sink.fail_next_writes(1);
        assert!(encoder.flush(&mut muxer, 0).is_err());
        assert_eq!(encoder.state(), EncoderState::Flushing);

        encoder.flush(&mut muxer, 0).unwrap();
        assert_eq!(encoder.state(), EncoderState::Flushed);
        assert_eq!(sink.packets().len(), 3);
    }

    #[test]
    fn test_reset_requires_flushed_state() {
        let (mut encoder, mut muxer, _sink) = setup(0);
        assert!(encoder.reset().is_err());
        encoder.flush(&mut muxer, 0).unwrap();
        encoder.reset().unwrap();
        assert_eq!(encoder.state(), EncoderState::Open);
        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
    }

    #[test]
    fn test_encoder_fault_is_encode_error() {
        let backend = MemoryBackend::new().with_encoder_fault_after(1);
        let handle = backend.open_encoder(&params()).unwrap();
        let container = backend
            .open_container(&OutputConfig::new("fault.ts"), &[handle.stream_params()])
            .unwrap();
        let mut muxer = Muxer::new(
            container,
            vec![StreamDescriptor {
                index: 0,
                kind: crate::media::MediaKind::Video,
                time_base: Rational::MPEG_TS,
            }],
            MonotonicPolicy::Drop,
            WriteErrorPolicy::Propagate,
        );
        let mut encoder = StreamEncoder::new(handle, params(), false);

        encoder.submit(&mut muxer, 0, &filter(), Some(&frame(0))).unwrap();
        let err = encoder
            .submit(&mut muxer, 0, &filter(), Some(&frame(40)))
            .unwrap_err();
        assert!(matches!(err, OutputError::Encode { .. }));
        assert!(!err.is_transient());
    }
}
