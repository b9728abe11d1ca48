//! Media vocabulary shared by every stage: time bases, frames, packets and
//! the read-only contexts supplied by the decode and filter collaborators.

pub mod context;
pub mod frame;
pub mod timebase;

pub use context::{CodecParameters, FilterContext, InputContext, InputStream};
pub use frame::{Frame, FrameFormat, MediaKind, Packet, PixelFormat, SampleFormat};
pub use timebase::{rescale_opt, Rational};
