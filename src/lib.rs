//! Frame bridge between an application and an asynchronous media pipeline
//!
//! Frames go in through [`PipelineSupervisor::submit`] together with
//! arbitrary user data and come back out of [`PipelineSupervisor::pop`]
//! paired with that same user data, even when the pipeline drops or
//! merges frames on the way.

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod utils;

pub use bridge::{BoundedFrameQueue, CorrespondenceBridge, DiscardPolicy};
pub use buffer::{BufferPool, ClockTime, FrameBuffer, FrameTiming, MapMode};
pub use config::{BridgeConfig, WatchdogConfig};
pub use error::{Error, Result};
pub use pipeline::{
    Caps, LoopbackPipeline, MediaPipeline, PipelineState, PipelineSupervisor,
};
