//! Re-association of pipeline output with the caller's metadata
//!
//! Every admitted frame gets a correspondence id, stamped on the buffer as
//! its sequence offset and as side-channel metadata. The caller's user data
//! waits in a FIFO of pending entries, ordered by ascending id. When the
//! pipeline hands a processed sample back, the id read off the sample picks
//! the matching pending entry; entries skipped on the way are frames the
//! pipeline merged or dropped internally.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use super::queue::BoundedFrameQueue;
use super::rate::{RateWindow, ReportThrottle};
use crate::buffer::{FrameBuffer, FrameTiming};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::pipeline::health::BridgeHealth;
use crate::pipeline::ports::{EgressItem, FlowReturn, IngestPort, Sample};

/// Which side gives way when the bridge runs full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Reject submissions while too many frames are in flight; publication
    /// to the output queue blocks
    DiscardInput,
    /// Admit every submission; matched frames are dropped when the output
    /// queue is full
    DiscardOutput,
}

impl std::fmt::Display for DiscardPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardPolicy::DiscardInput => write!(f, "discard_input"),
            DiscardPolicy::DiscardOutput => write!(f, "discard_output"),
        }
    }
}

struct PendingEntry<T> {
    offset: u64,
    timing: FrameTiming,
    user_data: T,
}

struct Pending<T> {
    entries: VecDeque<PendingEntry<T>>,
    next_id: u64,
    /// Ids below this one may belong to evicted entries
    evicted_below: u64,
}

/// Result of matching one correspondence id against the pending entries
enum Match<T> {
    Found { entry: PendingEntry<T>, stale: u64 },
    Unmatched { stale: u64 },
}

/// Matches egress results back to submitted metadata
pub struct CorrespondenceBridge<T> {
    policy: DiscardPolicy,
    output: BoundedFrameQueue<(FrameBuffer, T)>,
    pending: Mutex<Pending<T>>,
    max_input_pending: usize,
    max_pending: usize,
    health: Arc<BridgeHealth>,
    input_rate: Mutex<RateWindow>,
    output_rate: Mutex<RateWindow>,
    eviction_reports: ReportThrottle,
    output_drop_reports: ReportThrottle,
    correspondence_fail_reports: ReportThrottle,
}

impl<T> CorrespondenceBridge<T> {
    pub fn new(config: &BridgeConfig, health: Arc<BridgeHealth>) -> Self {
        Self {
            policy: config.discard_policy,
            output: BoundedFrameQueue::with_poll_interval(
                config.max_output_queue,
                config.push_poll_interval(),
            ),
            pending: Mutex::new(Pending {
                entries: VecDeque::new(),
                next_id: 0,
                evicted_below: 0,
            }),
            max_input_pending: config.max_input_queue,
            max_pending: config.max_pending,
            health,
            input_rate: Mutex::new(RateWindow::new(config.rate_report_interval())),
            output_rate: Mutex::new(RateWindow::new(config.rate_report_interval())),
            eviction_reports: ReportThrottle::new(config.frame_drop_report_rate),
            output_drop_reports: ReportThrottle::new(config.frame_drop_report_rate),
            correspondence_fail_reports: ReportThrottle::new(
                config.correspondence_fail_report_rate,
            ),
        }
    }

    pub fn policy(&self) -> DiscardPolicy {
        self.policy
    }

    /// Queue of matched `(buffer, user_data)` pairs
    pub fn output(&self) -> &BoundedFrameQueue<(FrameBuffer, T)> {
        &self.output
    }

    /// Number of submitted frames still waiting for their result
    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Correspondence id the next admitted frame will get
    pub fn next_id(&self) -> u64 {
        self.pending.lock().next_id
    }

    pub fn set_drain_mode(&self, draining: bool) {
        self.output.set_drain_mode(draining);
    }

    /// Drop every matched pair waiting in the output queue
    pub fn clear(&self) {
        self.output.clear();
    }

    /// Forget every pending entry, returning how many were dropped
    ///
    /// Meant for a pipeline that was just stopped: its ingest was flushed,
    /// so no result will come back for these frames. A late result for one
    /// of the dropped ids is discarded as unmatched.
    pub fn reset_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.entries.len();
        pending.entries.clear();
        pending.evicted_below = pending.next_id;
        drop(pending);

        if dropped > 0 {
            self.health.record_stale(dropped as u64);
            debug!("CorrespondenceBridge: dropped {} pending entries", dropped);
        }
        dropped
    }

    /// Forward a frame into the pipeline and remember its user data
    ///
    /// The buffer's presentation timing must already be set; its sequence
    /// offset and correspondence id are assigned here. Returns `Ok(false)`
    /// when the frame was not admitted, either because too many frames are
    /// in flight under [`DiscardPolicy::DiscardInput`] or because the
    /// ingest port refused it.
    pub fn submit(&self, ingest: &IngestPort, mut buffer: FrameBuffer, user_data: T) -> Result<bool> {
        let size = buffer.size()?;
        buffer.unmap();
        let mut timing = buffer.timing()?;

        let id = {
            let mut pending = self.pending.lock();
            if self.policy == DiscardPolicy::DiscardInput
                && pending.entries.len() >= self.max_input_pending
            {
                drop(pending);
                self.health.record_rejection();
                return Ok(false);
            }

            let id = pending.next_id;
            timing.offset = id;
            buffer.set_timing(timing)?;
            buffer.set_correspondence_id(id)?;

            // Registered before the push so that a fast pipeline cannot
            // deliver the result ahead of its entry
            pending.next_id += 1;
            pending.entries.push_back(PendingEntry {
                offset: id,
                timing,
                user_data,
            });

            if pending.entries.len() > self.max_pending {
                if let Some(evicted) = pending.entries.pop_front() {
                    pending.evicted_below = evicted.offset + 1;
                }
                self.health.record_eviction();
                if self.eviction_reports.hit() {
                    warn!(
                        "CorrespondenceBridge: pending queue is full, evicted {} entries",
                        self.eviction_reports.every()
                    );
                }
            }
            id
        };

        let flow = ingest.push_buffer(buffer);
        if flow != FlowReturn::Ok {
            self.withdraw(id);
            self.health.record_rejection();
            debug!("CorrespondenceBridge: ingest refused frame {}: {:?}", id, flow);
            return Ok(false);
        }

        self.health.record_submit(size);
        if let Some(report) = self.input_rate.lock().record(size) {
            info!("Pushing frames into pipeline at {}", report);
        }
        Ok(true)
    }

    /// Undo the registration of a frame the ingest port refused
    fn withdraw(&self, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(index) = pending.entries.iter().rposition(|entry| entry.offset == id) {
            pending.entries.remove(index);
        }
        if pending.next_id == id + 1 {
            pending.next_id = id;
        }
    }

    /// Handle one item delivered by the pipeline's egress port
    ///
    /// Runs on the pipeline's delivery thread. Only an ordering violation
    /// is reported as an error; every other anomaly is logged, counted and
    /// the sample discarded.
    pub fn on_egress_result(&self, item: EgressItem) -> Result<()> {
        let sample = match item {
            EgressItem::EndOfStream => {
                info!("CorrespondenceBridge: received end of stream");
                return Ok(());
            }
            EgressItem::Sample(sample) => sample,
        };

        match self.match_sample(sample) {
            Err(e @ (Error::Map { .. } | Error::BufferReleased)) => {
                self.health.record_map_failure();
                warn!("CorrespondenceBridge: dropping unreadable frame: {}", e);
                Ok(())
            }
            result => result,
        }
    }

    fn match_sample(&self, sample: Sample) -> Result<()> {
        let Some((mut buffer, id)) = self.take_payload(sample)? else {
            self.health.record_uncorrelated();
            if self.correspondence_fail_reports.hit() {
                warn!("CorrespondenceBridge: could not establish correspondence of frame and user data");
            }
            return Ok(());
        };

        let size = buffer.size()?;
        buffer.unmap();
        self.health.record_egress_bytes(size);
        if let Some(report) = self.output_rate.lock().record(size) {
            info!("Outputting frames at {}", report);
        }

        let (entry, stale) = match self.match_pending(id)? {
            Match::Found { entry, stale } => (entry, stale),
            Match::Unmatched { stale } => {
                self.health.record_stale(stale);
                self.health.record_unmatched();
                error!(
                    "CorrespondenceBridge: received frame {} but no user data is pending, discarding",
                    id
                );
                return Ok(());
            }
        };
        if stale > 0 {
            self.health.record_stale(stale);
            debug!("CorrespondenceBridge: skipped {} stale entries before frame {}", stale, id);
        }

        buffer.set_timing(entry.timing)?;
        self.publish(buffer, entry.user_data);
        Ok(())
    }

    /// Deep-copy the payload and release the sample right away
    ///
    /// Returns `None` when the sample carries no correspondence id.
    fn take_payload(&self, sample: Sample) -> Result<Option<(FrameBuffer, u64)>> {
        let mut view = sample.buffer()?;
        let Some(id) = view.correspondence_id()? else {
            return Ok(None);
        };
        let copy = view.deep_copy()?;

        // The sample holds a slot of the pipeline's pool
        drop(view);
        drop(sample);
        Ok(Some((copy, id)))
    }

    fn match_pending(&self, id: u64) -> Result<Match<T>> {
        let mut pending = self.pending.lock();
        let mut stale = 0;
        loop {
            let Some(offset) = pending.entries.front().map(|entry| entry.offset) else {
                return Ok(Match::Unmatched { stale });
            };
            match offset.cmp(&id) {
                Ordering::Less => {
                    pending.entries.pop_front();
                    stale += 1;
                }
                Ordering::Equal => break,
                // The entry was evicted while its frame was still in flight
                Ordering::Greater if id < pending.evicted_below => {
                    return Ok(Match::Unmatched { stale });
                }
                Ordering::Greater => {
                    drop(pending);
                    self.health.record_stale(stale);
                    return Err(Error::OrderingViolation { id, oldest: offset });
                }
            }
        }

        Ok(match pending.entries.pop_front() {
            Some(entry) => Match::Found { entry, stale },
            None => Match::Unmatched { stale },
        })
    }

    fn publish(&self, buffer: FrameBuffer, user_data: T) {
        let pushed = match self.policy {
            DiscardPolicy::DiscardOutput => self.output.try_push((buffer, user_data)),
            DiscardPolicy::DiscardInput => self.output.push_blocking((buffer, user_data)),
        };

        match pushed {
            Ok(()) => self.health.record_delivered(),
            Err(_dropped) => {
                self.health.record_output_drop();
                if self.output_drop_reports.hit() {
                    warn!(
                        "CorrespondenceBridge: output queue is full, dropped {} frames",
                        self.output_drop_reports.every()
                    );
                }
            }
        }
    }
}
