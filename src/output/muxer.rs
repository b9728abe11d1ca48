//! Packet writer: rescales encoder packets into stream time bases, keeps each
//! stream's timestamps strictly increasing and appends to the container.

use super::config::{MonotonicPolicy, WriteErrorPolicy};
use super::context::OutputContext;
use crate::codec::{CodecError, Container};
use crate::error::{OutputError, Result};
use crate::media::{rescale_opt, MediaKind, Packet, Rational};

/// One output stream as declared in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: MediaKind,
    /// Time base chosen by the container.
    pub time_base: Rational,
}

/// What happened to a packet handed to the muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOutcome {
    /// Written unchanged apart from rescaling.
    Written,
    /// Written after moving it past the stream watermark.
    Clamped,
    /// Dropped because it was not past the stream watermark.
    Dropped,
    /// Discarded because its stream was aborted after a write failure.
    Discarded,
}

/// Packet counters kept by the muxer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxCounters {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub dropped_packets: u64,
    pub clamped_packets: u64,
    pub discarded_packets: u64,
}

#[derive(Debug)]
struct StreamState {
    descriptor: StreamDescriptor,
    /// Last written ordering timestamp, stream time base.
    watermark: Option<i64>,
    last_duration: i64,
    /// Added to every timestamp after a discontinuity.
    offset: i64,
    discontinuity: bool,
    aborted: bool,
}

/// Container handle plus the per-stream write state.
pub struct Muxer {
    container: Option<Box<dyn Container>>,
    streams: Vec<StreamState>,
    monotonic: MonotonicPolicy,
    on_write_error: WriteErrorPolicy,
    aborted: bool,
    counters: MuxCounters,
}

impl Muxer {
    pub fn new(
        container: Box<dyn Container>,
        descriptors: Vec<StreamDescriptor>,
        monotonic: MonotonicPolicy,
        on_write_error: WriteErrorPolicy,
    ) -> Self {
        let streams = descriptors
            .into_iter()
            .map(|descriptor| StreamState {
                descriptor,
                watermark: None,
                last_duration: 0,
                offset: 0,
                discontinuity: false,
                aborted: false,
            })
            .collect();

        Self {
            container: Some(container),
            streams,
            monotonic,
            on_write_error,
            aborted: false,
            counters: MuxCounters::default(),
        }
    }

    pub fn descriptor(&self, stream: usize) -> Option<&StreamDescriptor> {
        self.streams.get(stream).map(|s| &s.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.streams.iter().map(|s| &s.descriptor)
    }

    /// Last timestamp written to `stream`, in the stream's time base.
    pub fn last_written(&self, stream: usize) -> Option<i64> {
        self.streams.get(stream).and_then(|s| s.watermark)
    }

    pub fn counters(&self) -> MuxCounters {
        self.counters
    }

    pub fn is_open(&self) -> bool {
        self.container.is_some()
    }

    /// Whether writes to `stream` have been given up on.
    pub fn is_aborted(&self, stream: usize) -> bool {
        self.aborted || self.streams.get(stream).is_some_and(|s| s.aborted)
    }

    /// Fail the way a write to `stream` would once the whole output is aborted.
    pub(crate) fn check_output(&self, stream: usize) -> Result<()> {
        if self.aborted {
            Err(output_aborted(stream))
        } else {
            Ok(())
        }
    }

    /// Shift subsequent timestamps of every stream so they continue right
    /// after what was already written.
    pub fn mark_discontinuity(&mut self) {
        for state in &mut self.streams {
            state.discontinuity = true;
        }
    }

    /// Rescale `packet` from `encoder_time_base`, order-check it and write it.
    ///
    /// On a write failure nothing about the stream changes, so the same packet
    /// can be submitted again.
    pub fn write(
        &mut self,
        mut packet: Packet,
        encoder_time_base: Rational,
        stream: usize,
    ) -> Result<MuxOutcome> {
        let container = self.container.as_mut().ok_or(OutputError::Closed)?;
        let state = self.streams.get_mut(stream).ok_or_else(|| {
            OutputError::configuration(format!("no output stream {}", stream))
        })?;

        if self.aborted {
            return Err(output_aborted(stream));
        }
        if state.aborted {
            self.counters.discarded_packets += 1;
            return Ok(MuxOutcome::Discarded);
        }

        let stream_tb = state.descriptor.time_base;
        packet.pts = rescale_opt(packet.pts, encoder_time_base, stream_tb);
        packet.dts = rescale_opt(packet.dts, encoder_time_base, stream_tb);
        packet.duration = Rational::rescale(packet.duration, encoder_time_base, stream_tb);

        let mut offset = state.offset;
        if state.discontinuity {
            if let (Some(last), Some(first)) = (state.watermark, packet.order_ts()) {
                offset = last
                    .saturating_add(state.last_duration.max(1))
                    .saturating_sub(first);
            }
        }
        packet.pts = packet.pts.map(|ts| ts.saturating_add(offset));
        packet.dts = packet.dts.map(|ts| ts.saturating_add(offset));

        let mut outcome = MuxOutcome::Written;
        if let (Some(ts), Some(last)) = (packet.order_ts(), state.watermark) {
            if ts <= last {
                match self.monotonic {
                    MonotonicPolicy::Clamp if last < i64::MAX => {
                        let clamped = last + 1;
                        if packet.pts.is_some() {
                            packet.pts = Some(clamped);
                        }
                        packet.dts = Some(clamped);
                        log::debug!(
                            "Clamped packet on stream {} from {} to {}",
                            stream,
                            ts,
                            clamped
                        );
                        outcome = MuxOutcome::Clamped;
                    }
                    // Drop, or a clamp with no room left past the watermark
                    _ => {
                        log::debug!(
                            "Dropping late packet on stream {}: {} <= {}",
                            stream,
                            ts,
                            last
                        );
                        self.counters.dropped_packets += 1;
                        return Ok(MuxOutcome::Dropped);
                    }
                }
            }
        }

        packet.stream_index = stream;
        if let Err(source) = container.write_packet(&packet) {
            log::warn!("Write failed on stream {}: {}", stream, source);
            match self.on_write_error {
                WriteErrorPolicy::Propagate => {}
                WriteErrorPolicy::AbortStream => state.aborted = true,
                WriteErrorPolicy::AbortOutput => self.aborted = true,
            }
            return Err(OutputError::Write { stream, source });
        }

        if let Some(ts) = packet.order_ts() {
            state.watermark = Some(ts);
        }
        state.last_duration = packet.duration;
        state.offset = offset;
        state.discontinuity = false;

        match state.descriptor.kind {
            MediaKind::Video => self.counters.video_packets += 1,
            MediaKind::Audio => self.counters.audio_packets += 1,
        }
        if outcome == MuxOutcome::Clamped {
            self.counters.clamped_packets += 1;
        }
        Ok(outcome)
    }

    /// Write the trailer and release the container. Idempotent.
    pub fn finish(&mut self) -> std::result::Result<(), CodecError> {
        match self.container.take() {
            Some(mut container) => container.finish(),
            None => Ok(()),
        }
    }
}

fn output_aborted(stream: usize) -> OutputError {
    OutputError::Write {
        stream,
        source: CodecError::Io("output aborted by an earlier write failure".to_string()),
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("open", &self.container.is_some())
            .field("streams", &self.streams)
            .field("monotonic", &self.monotonic)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

/// Rescale `packet` from `encoder_time_base` into the time base of `stream`
/// and write it to the container of `output`.
pub fn mux(
    packet: Packet,
    encoder_time_base: Rational,
    output: &mut OutputContext,
    stream: usize,
) -> Result<MuxOutcome> {
    output.muxer_mut()?.write(packet, encoder_time_base, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecBackend, MemoryBackend, MemorySink, StreamParams};
    use crate::media::{FrameFormat, PixelFormat};
    use crate::output::OutputConfig;
    use std::sync::Arc;

    fn video_stream(time_base: Rational) -> StreamParams {
        let format = FrameFormat::Video {
            width: 16,
            height: 16,
            pixel_format: PixelFormat::Yuv420p,
        };
        StreamParams::new("h264", format, time_base)
    }

    fn muxer(
        monotonic: MonotonicPolicy,
        on_write_error: WriteErrorPolicy,
        streams: usize,
    ) -> (Muxer, Arc<MemorySink>) {
        let backend = MemoryBackend::new();
        let params: Vec<_> = (0..streams).map(|_| video_stream(Rational::MPEG_TS)).collect();
        let container = backend
            .open_container(&OutputConfig::new("mux.ts"), &params)
            .unwrap();
        let descriptors = (0..streams)
            .map(|index| StreamDescriptor {
                index,
                kind: MediaKind::Video,
                time_base: Rational::MPEG_TS,
            })
            .collect();
        let sink = backend.sink("mux.ts").unwrap();
        (
            Muxer::new(container, descriptors, monotonic, on_write_error),
            sink,
        )
    }

    fn packet(pts: i64) -> Packet {
        Packet::new(vec![0], Some(pts), Some(pts), 40)
    }

    #[test]
    fn test_write_rescales_timestamps() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 1);
        let outcome = muxer.write(packet(1), Rational::MILLIS, 0).unwrap();
        assert_eq!(outcome, MuxOutcome::Written);

        let written = sink.packets();
        assert_eq!(written[0].pts, Some(90));
        assert_eq!(written[0].dts, Some(90));
        assert_eq!(written[0].duration, 3600);
        assert_eq!(muxer.last_written(0), Some(90));
    }

    #[test]
    fn test_drop_policy_discards_late_packets() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 1);
        for pts in [0, 40, 40, 20, 80] {
            muxer.write(packet(pts), Rational::MILLIS, 0).unwrap();
        }
        let pts: Vec<_> = sink.packets().iter().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, [0, 3600, 7200]);
        assert_eq!(muxer.counters().dropped_packets, 2);
        assert_eq!(muxer.counters().video_packets, 3);
    }

    #[test]
    fn test_clamp_policy_moves_packets_past_watermark() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Clamp, WriteErrorPolicy::Propagate, 1);
        for pts in [0, 40, 40, 20] {
            muxer.write(packet(pts), Rational::MILLIS, 0).unwrap();
        }
        let pts: Vec<_> = sink.packets().iter().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, [0, 3600, 3601, 3602]);
        let dts: Vec<_> = sink.packets().iter().map(|p| p.dts.unwrap()).collect();
        assert_eq!(dts, [0, 3600, 3601, 3602]);
        assert_eq!(muxer.counters().clamped_packets, 2);
    }

    #[test]
    fn test_streams_have_independent_watermarks() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 2);
        muxer.write(packet(100), Rational::MILLIS, 0).unwrap();
        assert_eq!(
            muxer.write(packet(0), Rational::MILLIS, 1).unwrap(),
            MuxOutcome::Written
        );
        assert_eq!(sink.stream_packets(1).len(), 1);
        assert!(muxer.write(packet(0), Rational::MILLIS, 2).is_err());
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 1);
        muxer.write(packet(0), Rational::MILLIS, 0).unwrap();

        sink.fail_next_writes(1);
        let err = muxer.write(packet(40), Rational::MILLIS, 0).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(muxer.last_written(0), Some(0));
        assert_eq!(muxer.counters().video_packets, 1);

        // the retried packet is not mistaken for a late one
        assert_eq!(
            muxer.write(packet(40), Rational::MILLIS, 0).unwrap(),
            MuxOutcome::Written
        );
        assert_eq!(muxer.last_written(0), Some(3600));
    }

    #[test]
    fn test_abort_stream_policy() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::AbortStream, 2);
        sink.fail_next_writes(1);
        assert!(muxer.write(packet(0), Rational::MILLIS, 0).is_err());
        assert!(muxer.is_aborted(0));
        assert!(!muxer.is_aborted(1));

        assert_eq!(
            muxer.write(packet(40), Rational::MILLIS, 0).unwrap(),
            MuxOutcome::Discarded
        );
        assert_eq!(
            muxer.write(packet(40), Rational::MILLIS, 1).unwrap(),
            MuxOutcome::Written
        );
        assert_eq!(muxer.counters().discarded_packets, 1);
    }

    #[test]
    fn test_abort_output_policy() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::AbortOutput, 2);
        sink.fail_next_writes(1);
        assert!(muxer.write(packet(0), Rational::MILLIS, 0).is_err());
        assert!(muxer.is_aborted(1));
        let err = muxer.write(packet(0), Rational::MILLIS, 1).unwrap_err();
        assert!(matches!(err, OutputError::Write { stream: 1, .. }));
        assert!(sink.packets().is_empty());
    }

    #[test]
    fn test_discontinuity_continues_timeline() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 1);
        muxer.write(packet(0), Rational::MILLIS, 0).unwrap();
        muxer.write(packet(40), Rational::MILLIS, 0).unwrap();

        // source restarts at zero
        muxer.mark_discontinuity();
        muxer.write(packet(0), Rational::MILLIS, 0).unwrap();
        muxer.write(packet(40), Rational::MILLIS, 0).unwrap();

        let pts: Vec<_> = sink.packets().iter().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, [0, 3600, 7200, 10800]);
    }

    #[test]
    fn test_clamp_at_timestamp_limit_drops() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Clamp, WriteErrorPolicy::Propagate, 1);
        let last = Packet::new(vec![0], Some(i64::MAX), Some(i64::MAX), 1);
        muxer.write(last, Rational::MPEG_TS, 0).unwrap();

        assert_eq!(
            muxer.write(packet(0), Rational::MPEG_TS, 0).unwrap(),
            MuxOutcome::Dropped
        );
        assert_eq!(muxer.counters().dropped_packets, 1);

        // a discontinuity cannot push the timeline past the limit either
        muxer.mark_discontinuity();
        assert_eq!(
            muxer.write(packet(0), Rational::MPEG_TS, 0).unwrap(),
            MuxOutcome::Dropped
        );
        assert_eq!(sink.packets().len(), 1);
        assert_eq!(muxer.last_written(0), Some(i64::MAX));
    }

    #[test]
    fn test_rescale_saturation_then_late_packet() {
        let (mut muxer, _sink) = muxer(MonotonicPolicy::Clamp, WriteErrorPolicy::Propagate, 1);
        let huge = Packet::new(vec![0], Some(i64::MAX / 2), None, 0);
        muxer.write(huge, Rational::new(1, 1), 0).unwrap();
        assert_eq!(muxer.last_written(0), Some(i64::MAX));

        let outcome = muxer.write(packet(40), Rational::MILLIS, 0).unwrap();
        assert_eq!(outcome, MuxOutcome::Dropped);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let (mut muxer, sink) = muxer(MonotonicPolicy::Drop, WriteErrorPolicy::Propagate, 1);
        muxer.finish().unwrap();
        muxer.finish().unwrap();
        assert!(sink.is_finished());
        assert!(!muxer.is_open());
        assert!(matches!(
            muxer.write(packet(0), Rational::MILLIS, 0),
            Err(OutputError::Closed)
        ));
    }
}
