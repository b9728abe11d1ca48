//! Pipeline runner: pulls frames from an output's queue and drives its
//! encoders until end of stream.

mod queue;

pub use queue::{OutputQueue, QueueItem, QueueSender};

use crate::error::{OutputError, Result};
use crate::media::{FilterContext, InputContext};
use crate::output::{process, OutputContext, OutputStats};

/// Run `output` until its queue reports end of stream, then flush every
/// encoder.
///
/// `filters[i]` describes the frames delivered for output stream `i`.
/// The context stays open; the caller closes it under the policy it wants.
pub fn run(
    output: &mut OutputContext,
    input: &InputContext,
    filters: &[FilterContext],
) -> Result<OutputStats> {
    run_with_progress(output, input, filters, None)
}

/// Like [`run`], calling `progress_callback` with the number of frames
/// processed so far after every frame.
pub fn run_with_progress(
    output: &mut OutputContext,
    input: &InputContext,
    filters: &[FilterContext],
    progress_callback: Option<Box<dyn Fn(u64) + Send>>,
) -> Result<OutputStats> {
    if filters.len() != output.stream_count() {
        return Err(OutputError::configuration(format!(
            "{} filter(s) for {} output stream(s) of {}",
            filters.len(),
            output.stream_count(),
            output.target()
        )));
    }

    let mut processed = 0u64;
    loop {
        let (stream, frame) = match output.queue().take() {
            QueueItem::Frame { stream, frame } => (stream, frame),
            QueueItem::EndOfStream => break,
        };
        let filter = filters.get(stream).ok_or_else(|| {
            OutputError::configuration(format!(
                "frame for missing output stream {} of {}",
                stream,
                output.target()
            ))
        })?;

        process(input, output, stream, filter, Some(&frame))?;
        processed += 1;

        if let Some(ref callback) = progress_callback {
            callback(processed);
        }
    }

    log::debug!(
        "End of stream on {} after {} frame(s), flushing",
        output.target(),
        processed
    );
    for (stream, filter) in filters.iter().enumerate() {
        process(input, output, stream, filter, None)?;
    }

    let stats = output.stats();
    log::info!("Finished {}: {}", output.target(), stats);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryBackend;
    use crate::media::{CodecParameters, Frame, PixelFormat, Rational};
    use crate::output::{ClosePolicy, EncoderConfig, EncoderState, OutputConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn input() -> InputContext {
        InputContext::new().with_stream(
            Rational::new(1, 90_000),
            CodecParameters::video("h264", 16, 16, Rational::new(25, 1)),
        )
    }

    #[test]
    fn test_run_until_end_of_stream() {
        let backend = MemoryBackend::new();
        let (tx, queue) = OutputQueue::bounded(8);
        let config = OutputConfig::new("run.ts").with_stream(0, EncoderConfig::new("libx264"));
        let mut output = OutputContext::open(&input(), &config, &backend, queue, None).unwrap();
        let filters = [FilterContext::video(16, 16, PixelFormat::Yuv420p, Rational::MILLIS)];

        for pts in [0, 40, 80, 120] {
            tx.send(0, Frame::video(16, 16, PixelFormat::Yuv420p, pts)).unwrap();
        }
        tx.finish().unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let stats = run_with_progress(
            &mut output,
            &input(),
            &filters,
            Some(Box::new(move |n| counter.store(n, Ordering::SeqCst))),
        )
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(stats.video_frames, 4);
        assert_eq!(stats.video_packets, 4);
        assert_eq!(stats.pixels, 4 * 256);
        assert_eq!(output.encoder_state(0), Some(EncoderState::Flushed));
        output.close(ClosePolicy::ForceClose);
    }

    #[test]
    fn test_run_rejects_filter_count() {
        let backend = MemoryBackend::new();
        let (_tx, queue) = OutputQueue::bounded(1);
        let config = OutputConfig::new("run.ts").with_stream(0, EncoderConfig::new("libx264"));
        let mut output = OutputContext::open(&input(), &config, &backend, queue, None).unwrap();

        let err = run(&mut output, &input(), &[]).unwrap_err();
        assert!(matches!(err, OutputError::Configuration(_)));
    }
}
