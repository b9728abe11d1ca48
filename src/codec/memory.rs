//! In-process backend with deterministic encoders and recording containers.
//!
//! Encoders hold back a configurable number of frames before emitting packets,
//! the same N-in/M-out shape as a lookahead encoder, and hand out everything
//! left on flush. Containers record written packets in a [`MemorySink`] that
//! can be inspected and told to fail writes. [`BackendCounters`] track live
//! handles and initialisations so reuse and teardown can be observed.

use super::{
    CodecBackend, CodecError, Container, Encode, EncoderParams, ReceiveOutcome, StreamParams,
};
use crate::media::{Frame, FrameFormat, MediaKind, Packet, Rational};
use crate::output::OutputConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const VIDEO_CODECS: &[&str] = &[
    "h264",
    "libx264",
    "hevc",
    "libx265",
    "h264_nvenc",
    "hevc_nvenc",
    "h264_qsv",
    "h264_vaapi",
    "h264_videotoolbox",
];

const AUDIO_CODECS: &[&str] = &["aac", "opus", "libopus"];

const FORMATS: &[&str] = &["mpegts", "hls", "mp4", "mov", "matroska", "null"];

/// Live handle and initialisation counts shared by everything one
/// [`MemoryBackend`] allocates.
#[derive(Debug, Default)]
pub struct BackendCounters {
    live_encoders: AtomicUsize,
    live_hardware_encoders: AtomicUsize,
    live_containers: AtomicUsize,
    encoder_inits: AtomicUsize,
    device_inits: AtomicUsize,
}

impl BackendCounters {
    pub fn live_encoders(&self) -> usize {
        self.live_encoders.load(Ordering::SeqCst)
    }

    pub fn live_hardware_encoders(&self) -> usize {
        self.live_hardware_encoders.load(Ordering::SeqCst)
    }

    pub fn live_containers(&self) -> usize {
        self.live_containers.load(Ordering::SeqCst)
    }

    /// Encoders allocated so far, software and hardware.
    pub fn encoder_inits(&self) -> usize {
        self.encoder_inits.load(Ordering::SeqCst)
    }

    /// Hardware device sessions created so far.
    pub fn device_inits(&self) -> usize {
        self.device_inits.load(Ordering::SeqCst)
    }
}

/// Packets written to one in-memory container.
#[derive(Debug, Default)]
pub struct MemorySink {
    packets: Mutex<Vec<Packet>>,
    stream_time_bases: Mutex<Vec<Rational>>,
    fail_writes: AtomicUsize,
    finished: AtomicBool,
}

impl MemorySink {
    /// Snapshot of every packet written so far, in write order.
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Packets written to one stream.
    pub fn stream_packets(&self, index: usize) -> Vec<Packet> {
        self.packets()
            .into_iter()
            .filter(|p| p.stream_index == index)
            .collect()
    }

    pub fn stream_time_bases(&self) -> Vec<Rational> {
        self.stream_time_bases
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Make the next `count` writes fail as if the destination were
    /// momentarily unwritable.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Whether the trailer was written.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Deterministic in-process [`CodecBackend`].
#[derive(Debug)]
pub struct MemoryBackend {
    counters: Arc<BackendCounters>,
    sinks: Mutex<HashMap<String, Arc<MemorySink>>>,
    delay: usize,
    device_limit: Option<usize>,
    fail_after: Option<u64>,
    stream_time_base: Option<Rational>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            counters: Arc::new(BackendCounters::default()),
            sinks: Mutex::new(HashMap::new()),
            delay: 2,
            device_limit: None,
            fail_after: None,
            stream_time_base: None,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames each encoder holds back before emitting a packet.
    pub fn with_delay(mut self, frames: usize) -> Self {
        self.delay = frames;
        self
    }

    /// Maximum number of simultaneously live hardware encoders.
    pub fn with_device_limit(mut self, limit: usize) -> Self {
        self.device_limit = Some(limit);
        self
    }

    /// Encoders fault on the submission following `frames` accepted frames.
    pub fn with_encoder_fault_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Force every container stream to this time base.
    pub fn with_stream_time_base(mut self, time_base: Rational) -> Self {
        self.stream_time_base = Some(time_base);
        self
    }

    pub fn counters(&self) -> Arc<BackendCounters> {
        Arc::clone(&self.counters)
    }

    /// Sink of the most recent container opened for `target`.
    pub fn sink(&self, target: &str) -> Option<Arc<MemorySink>> {
        self.sinks.lock().ok()?.get(target).cloned()
    }

    fn container_time_base(&self, format: Option<&str>, stream: &StreamParams) -> Rational {
        if let Some(tb) = self.stream_time_base {
            return tb;
        }
        match format {
            Some("mpegts") | Some("hls") => Rational::MPEG_TS,
            _ => stream.time_base,
        }
    }
}

impl CodecBackend for MemoryBackend {
    fn open_encoder(&self, params: &EncoderParams) -> Result<Box<dyn Encode>, CodecError> {
        let known = match params.kind() {
            MediaKind::Video => VIDEO_CODECS,
            MediaKind::Audio => AUDIO_CODECS,
        };
        if !known.contains(&params.codec.as_str()) {
            return Err(CodecError::Unsupported(format!(
                "{} encoder '{}'",
                params.kind(),
                params.codec
            )));
        }

        let hardware = params.is_hardware();
        if hardware {
            let live = self.counters.live_hardware_encoders();
            if self.device_limit.is_some_and(|limit| live >= limit) {
                return Err(CodecError::Allocation(format!(
                    "no free {} session for '{}' ({} in use)",
                    params
                        .hardware
                        .as_ref()
                        .map(|h| h.device_type.as_str())
                        .unwrap_or("hardware"),
                    params.codec,
                    live
                )));
            }
            self.counters.device_inits.fetch_add(1, Ordering::SeqCst);
            self.counters
                .live_hardware_encoders
                .fetch_add(1, Ordering::SeqCst);
        }
        self.counters.encoder_inits.fetch_add(1, Ordering::SeqCst);
        self.counters.live_encoders.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(BufferedEncoder {
            params: params.clone(),
            counters: Arc::clone(&self.counters),
            delay: self.delay,
            fail_after: self.fail_after,
            pending: VecDeque::new(),
            accepted: 0,
            eof: false,
        }))
    }

    fn open_container(
        &self,
        config: &OutputConfig,
        streams: &[StreamParams],
    ) -> Result<Box<dyn Container>, CodecError> {
        let format = config.format_name();
        if let Some(name) = format.as_deref() {
            if !FORMATS.contains(&name) {
                return Err(CodecError::Unsupported(format!("container format '{}'", name)));
            }
        }
        if streams.is_empty() {
            return Err(CodecError::Unsupported(
                "container without streams".to_string(),
            ));
        }

        let time_bases: Vec<Rational> = streams
            .iter()
            .map(|s| self.container_time_base(format.as_deref(), s))
            .collect();

        let sink = Arc::new(MemorySink::default());
        if let Ok(mut tbs) = sink.stream_time_bases.lock() {
            *tbs = time_bases.clone();
        }
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.insert(config.target.clone(), Arc::clone(&sink));
        }
        self.counters.live_containers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryContainer {
            sink,
            time_bases,
            counters: Arc::clone(&self.counters),
        }))
    }
}

/// Encoder that turns every frame into one packet after a fixed delay.
struct BufferedEncoder {
    params: EncoderParams,
    counters: Arc<BackendCounters>,
    delay: usize,
    fail_after: Option<u64>,
    pending: VecDeque<Packet>,
    accepted: u64,
    eof: bool,
}

impl BufferedEncoder {
    fn frame_duration(&self, frame: &Frame) -> i64 {
        match frame.format {
            FrameFormat::Video { .. } => self
                .params
                .frame_rate
                .map(|rate| Rational::rescale(1, rate.invert(), self.params.time_base))
                .unwrap_or(0),
            FrameFormat::Audio { sample_rate, .. } => Rational::rescale(
                frame.nb_samples as i64,
                Rational::new(1, sample_rate as i32),
                self.params.time_base,
            ),
        }
    }
}

impl Encode for BufferedEncoder {
    fn name(&self) -> &str {
        &self.params.codec
    }

    fn time_base(&self) -> Rational {
        self.params.time_base
    }

    fn is_hardware(&self) -> bool {
        self.params.is_hardware()
    }

    fn stream_params(&self) -> StreamParams {
        StreamParams::new(&self.params.codec, self.params.format, self.params.time_base)
            .with_frame_rate(self.params.frame_rate)
            .with_bitrate(self.params.bitrate)
    }

    fn send_frame(&mut self, frame: &Frame, pts: Option<i64>) -> Result<(), CodecError> {
        if self.eof {
            return Err(CodecError::Fault(format!(
                "{}: frame submitted after end of stream",
                self.params.codec
            )));
        }
        if self.fail_after.is_some_and(|limit| self.accepted >= limit) {
            return Err(CodecError::Fault(format!(
                "{}: encoder fault after {} frames",
                self.params.codec, self.accepted
            )));
        }

        let pts = pts.unwrap_or(self.accepted as i64);
        let is_keyframe = match self.params.gop_size {
            Some(gop) if gop > 0 => self.accepted % gop as u64 == 0,
            _ => self.accepted == 0,
        };
        let payload = (frame.data.len() as u32).to_le_bytes().to_vec();
        let packet = Packet::new(payload, Some(pts), Some(pts), self.frame_duration(frame))
            .with_keyframe(is_keyframe);

        self.pending.push_back(packet);
        self.accepted += 1;
        Ok(())
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        self.eof = true;
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<ReceiveOutcome, CodecError> {
        if self.eof {
            return Ok(match self.pending.pop_front() {
                Some(packet) => ReceiveOutcome::Packet(packet),
                None => ReceiveOutcome::Flushed,
            });
        }
        if self.pending.len() > self.delay {
            if let Some(packet) = self.pending.pop_front() {
                return Ok(ReceiveOutcome::Packet(packet));
            }
        }
        Ok(ReceiveOutcome::Again)
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        if !self.pending.is_empty() {
            return Err(CodecError::Fault(format!(
                "{}: {} packets still buffered",
                self.params.codec,
                self.pending.len()
            )));
        }
        self.eof = false;
        Ok(())
    }
}

impl Drop for BufferedEncoder {
    fn drop(&mut self) {
        self.counters.live_encoders.fetch_sub(1, Ordering::SeqCst);
        if self.params.is_hardware() {
            self.counters
                .live_hardware_encoders
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MemoryContainer {
    sink: Arc<MemorySink>,
    time_bases: Vec<Rational>,
    counters: Arc<BackendCounters>,
}

impl Container for MemoryContainer {
    fn stream_time_base(&self, index: usize) -> Option<Rational> {
        self.time_bases.get(index).copied()
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        if self.sink.is_finished() {
            return Err(CodecError::Io("container already finished".to_string()));
        }
        if packet.stream_index >= self.time_bases.len() {
            return Err(CodecError::Fault(format!(
                "no stream {} in container",
                packet.stream_index
            )));
        }
        let remaining = self.sink.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.sink.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(CodecError::Io(
                "destination temporarily unwritable".to_string(),
            ));
        }

        self.sink
            .packets
            .lock()
            .map_err(|_| CodecError::Fault("sink poisoned".to_string()))?
            .push(packet.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CodecError> {
        self.sink.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryContainer {
    fn drop(&mut self) {
        self.counters.live_containers.fetch_sub(1, Ordering::SeqCst);
    }
}
