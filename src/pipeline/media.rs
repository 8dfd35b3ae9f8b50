//! Interface of the external media pipeline

use super::bus::StatusBus;
use super::state::PipelineState;
use crate::buffer::ClockTime;
use crate::error::Result;

/// Handle to an opaque media pipeline
///
/// Produced by the factory passed to `PipelineSupervisor::initialize`,
/// which wires the pipeline to the supervisor's ingest and egress ports.
/// Only the factory knows the actual processing topology.
pub trait MediaPipeline: Send {
    /// Name used in log lines
    fn name(&self) -> &str;

    /// Move the pipeline to `target`, walking through intermediate states
    ///
    /// Fails with [`Error::StateChange`](crate::Error::StateChange) if the
    /// pipeline refuses the transition.
    fn set_state(&mut self, target: PipelineState) -> Result<()>;

    /// Status channel of this pipeline
    fn bus(&self) -> StatusBus;

    /// Current time on the pipeline clock
    fn clock_time(&self) -> ClockTime;
}
