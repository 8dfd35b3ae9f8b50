//! Status channel of the external pipeline
//!
//! The pipeline posts typed messages through a [`BusPoster`]; the
//! supervisor's status thread polls the matching [`StatusBus`] with a
//! timeout and a kind filter.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::time::{Duration, Instant};

use super::state::PipelineState;

/// Origin of a status message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// The pipeline itself
    Pipeline,
    /// A named element inside the pipeline
    Element(String),
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageSource::Pipeline => write!(f, "pipeline"),
            MessageSource::Element(name) => write!(f, "{}", name),
        }
    }
}

/// Message posted on the status bus
#[derive(Debug, Clone, PartialEq)]
pub enum StatusMessage {
    /// Fatal failure inside the pipeline
    Error {
        source: MessageSource,
        message: String,
        debug: Option<String>,
    },

    /// The stream finished
    EndOfStream,

    /// A state transition completed
    StateChanged {
        source: MessageSource,
        old: PipelineState,
        new: PipelineState,
        pending: Option<PipelineState>,
    },

    /// Non-fatal problem
    Warning {
        source: MessageSource,
        message: String,
    },
}

/// Kind of a [`StatusMessage`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    EndOfStream,
    StateChanged,
    Warning,
}

impl StatusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            StatusMessage::Error { .. } => MessageKind::Error,
            StatusMessage::EndOfStream => MessageKind::EndOfStream,
            StatusMessage::StateChanged { .. } => MessageKind::StateChanged,
            StatusMessage::Warning { .. } => MessageKind::Warning,
        }
    }
}

/// Create a connected poster/bus pair
pub fn channel() -> (BusPoster, StatusBus) {
    let (tx, rx) = unbounded();
    (BusPoster { tx }, StatusBus { rx })
}

/// Posting end, held by the pipeline
#[derive(Clone)]
pub struct BusPoster {
    tx: Sender<StatusMessage>,
}

impl BusPoster {
    /// Post a message; silently dropped if nobody listens anymore
    pub fn post(&self, message: StatusMessage) {
        let _ = self.tx.send(message);
    }
}

/// Receiving end, polled by the supervisor
#[derive(Clone)]
pub struct StatusBus {
    rx: Receiver<StatusMessage>,
}

impl StatusBus {
    /// Wait up to `timeout` for a message whose kind is in `kinds`
    ///
    /// Messages of other kinds are discarded while waiting.
    pub fn timed_pop_filtered(
        &self,
        timeout: Duration,
        kinds: &[MessageKind],
    ) -> Option<StatusMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(message) if kinds.contains(&message.kind()) => return Some(message),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    // Keep the poll cadence even once the pipeline is gone
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return None;
                }
            }
        }
    }

    /// Drop every queued message
    pub fn flush(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_discards_other_kinds() {
        let (poster, bus) = channel();
        poster.post(StatusMessage::Warning {
            source: MessageSource::Element("scale".into()),
            message: "late frame".into(),
        });
        poster.post(StatusMessage::EndOfStream);

        let message = bus.timed_pop_filtered(
            Duration::from_millis(10),
            &[MessageKind::EndOfStream, MessageKind::Error],
        );
        assert_eq!(message, Some(StatusMessage::EndOfStream));

        // The warning was consumed by the filter
        assert!(
            bus.timed_pop_filtered(Duration::from_millis(10), &[MessageKind::Warning])
                .is_none()
        );
    }

    #[test]
    fn test_flush_drops_queued_messages() {
        let (poster, bus) = channel();
        poster.post(StatusMessage::EndOfStream);
        poster.post(StatusMessage::EndOfStream);
        bus.flush();
        assert!(
            bus.timed_pop_filtered(Duration::ZERO, &[MessageKind::EndOfStream])
                .is_none()
        );
    }

    #[test]
    fn test_timeout_without_messages() {
        let (_poster, bus) = channel();
        let started = Instant::now();
        assert!(
            bus.timed_pop_filtered(Duration::from_millis(30), &[MessageKind::Error])
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
