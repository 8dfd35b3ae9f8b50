//! Frame buffers exchanged with the external pipeline
//!
//! - `frame`: native storage and the owned/borrowed `FrameBuffer` handle
//! - `meta`: timing fields and the correspondence side-channel
//! - `pool`: fixed-size buffer pool used on the pipeline side

pub mod frame;
pub mod meta;
pub mod pool;

pub use frame::{FrameBuffer, MapMode, MapState, NativeBuffer};
pub use meta::{BufferMeta, ClockTime, FrameTiming};
pub use pool::BufferPool;
