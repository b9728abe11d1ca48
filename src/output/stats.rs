use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters of one output context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStats {
    /// Video frames accepted by encoders.
    pub video_frames: u64,
    /// Audio frames accepted by encoders.
    pub audio_frames: u64,
    /// Pixels submitted for encoding, summed over every video frame.
    pub pixels: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    /// Late packets discarded by the monotonic check.
    pub dropped_packets: u64,
    /// Late packets moved past the stream watermark.
    pub clamped_packets: u64,
    /// Packets of aborted streams.
    pub discarded_packets: u64,
}

impl OutputStats {
    pub fn frames(&self) -> u64 {
        self.video_frames + self.audio_frames
    }

    pub fn packets(&self) -> u64 {
        self.video_packets + self.audio_packets
    }
}

impl fmt::Display for OutputStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames {}v/{}a, packets {}v/{}a, {} pixels",
            self.video_frames, self.audio_frames, self.video_packets, self.audio_packets, self.pixels
        )?;
        if self.dropped_packets + self.clamped_packets + self.discarded_packets > 0 {
            write!(
                f,
                " (dropped {}, clamped {}, discarded {})",
                self.dropped_packets, self.clamped_packets, self.discarded_packets
            )?;
        }
        Ok(())
    }
}
