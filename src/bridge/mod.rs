//! Frame hand-off between the application and the external pipeline
//!
//! - `queue`: bounded output queue with drain mode
//! - `correspondence`: matching of egress results to submitted user data
//! - `rate`: throughput windows and throttled reporting

pub mod correspondence;
pub mod queue;
pub mod rate;

pub use correspondence::{CorrespondenceBridge, DiscardPolicy};
pub use queue::{BoundedFrameQueue, QueueGuard};
pub use rate::{RateReport, RateWindow, ReportThrottle};
