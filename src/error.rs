//! Error types for the frame bridge.

use thiserror::Error;

use crate::buffer::MapMode;
use crate::pipeline::state::PipelineState;

/// Result type alias using the bridge's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `initialize()` was called on a supervisor that already owns a pipeline.
    #[error("pipeline was already initialized")]
    AlreadyInitialized,

    /// An operation that needs the pipeline ran before `initialize()`.
    #[error("pipeline was not initialized")]
    NotInitialized,

    /// The native buffer could not be locked for the requested access.
    #[error("unable to map buffer {mode}: {reason}")]
    Map {
        /// Requested access mode.
        mode: MapMode,
        /// Why the lock failed.
        reason: &'static str,
    },

    /// An egress result carried an id older than every pending entry.
    #[error("correspondence id {id} is smaller than the oldest pending entry {oldest}")]
    OrderingViolation {
        /// Id read off the egress buffer.
        id: u64,
        /// Offset of the front pending entry.
        oldest: u64,
    },

    /// The external pipeline refused a state transition.
    #[error("pipeline rejected state change to {target}")]
    StateChange {
        /// State that was requested.
        target: PipelineState,
    },

    /// The handle was already released or moved out.
    #[error("buffer handle has been released")]
    BufferReleased,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
