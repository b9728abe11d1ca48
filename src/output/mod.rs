//! The output stage: encoder driver, muxer and output context lifecycle.

mod config;
mod context;
mod encoder;
mod muxer;
mod stats;

pub use config::{
    EncoderConfig, HardwareConfig, MonotonicPolicy, OutputConfig, StreamConfig, WriteErrorPolicy,
};
pub use context::{ClosePolicy, HardwareEncoders, OutputContext};
pub use encoder::{process, EncoderState, StreamEncoder, DRAIN_LIMIT};
pub use muxer::{mux, MuxCounters, MuxOutcome, Muxer, StreamDescriptor};
pub use stats::OutputStats;
