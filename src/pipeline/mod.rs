//! Supervision of the external media pipeline
//!
//! The pipeline itself is opaque: it is built by a caller-supplied factory
//! around two ports and observed through its status bus.
//! - `ports`: ingest and egress boundaries
//! - `bus`: typed status messages
//! - `media`: the `MediaPipeline` trait
//! - `supervisor`: lifecycle, status thread and watchdog
//! - `loopback`: in-process pipeline for the demo and tests
//! - `clock`: pipeline clock and synthetic frame timing
//! - `health`: counters shared by the bridge and the supervisor

pub mod bus;
pub mod caps;
pub mod clock;
pub mod health;
pub mod loopback;
pub mod media;
pub mod ports;
pub mod state;
pub mod supervisor;

pub use bus::{BusPoster, MessageKind, MessageSource, StatusBus, StatusMessage};
pub use caps::Caps;
pub use clock::{FrameClock, SystemClock};
pub use health::{BridgeHealth, HealthSummary};
pub use loopback::{LoopbackControl, LoopbackOptions, LoopbackPipeline};
pub use media::MediaPipeline;
pub use ports::{EgressCallback, EgressItem, EgressPort, FlowReturn, IngestPort, Sample};
pub use state::PipelineState;
pub use supervisor::{PipelineSupervisor, StateChangeCallback};
