//! Ingest and egress boundaries of the external pipeline
//!
//! [`IngestPort`] is where the application hands buffers to the pipeline,
//! [`EgressPort`] is where the pipeline hands processed samples back. Both
//! are cheap to clone; clones share the same port.

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::caps::Caps;
use crate::buffer::FrameBuffer;
use crate::error::Result;

/// Outcome of pushing data across a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    /// Accepted
    Ok,
    /// The receiving side is not running
    Flushing,
    /// The stream already ended
    Eos,
    /// The receiving side failed
    Error,
}

impl FlowReturn {
    pub fn is_ok(&self) -> bool {
        matches!(self, FlowReturn::Ok)
    }
}

struct IngestState {
    queue: VecDeque<FrameBuffer>,
    queued_bytes: usize,
    caps: Option<Caps>,
    flushing: bool,
    eos: bool,
    total_pushed: u64,
}

struct IngestInner {
    state: Mutex<IngestState>,
    data_available: Condvar,
    space_available: Condvar,
    max_bytes: usize,
    poll_interval: Duration,
}

/// Application-to-pipeline port
///
/// Pushing blocks while more than `max_bytes` are queued. The port starts
/// flushing and only accepts data once the pipeline starts running.
#[derive(Clone)]
pub struct IngestPort {
    inner: Arc<IngestInner>,
}

impl IngestPort {
    pub fn new(max_bytes: usize, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(IngestInner {
                state: Mutex::new(IngestState {
                    queue: VecDeque::new(),
                    queued_bytes: 0,
                    caps: None,
                    flushing: true,
                    eos: false,
                    total_pushed: 0,
                }),
                data_available: Condvar::new(),
                space_available: Condvar::new(),
                max_bytes,
                poll_interval,
            }),
        }
    }

    /// Hand a buffer to the pipeline
    ///
    /// Ownership moves to the port whatever the outcome.
    pub fn push_buffer(&self, mut buffer: FrameBuffer) -> FlowReturn {
        let size = match buffer.size() {
            Ok(size) => size,
            Err(e) => {
                debug!("IngestPort: rejecting unmappable buffer: {}", e);
                return FlowReturn::Error;
            }
        };
        buffer.unmap();

        let mut state = self.inner.state.lock();
        while !state.flushing && !state.eos && state.queued_bytes >= self.inner.max_bytes {
            self.inner
                .space_available
                .wait_for(&mut state, self.inner.poll_interval);
        }
        if state.flushing {
            return FlowReturn::Flushing;
        }
        if state.eos {
            return FlowReturn::Eos;
        }

        state.queue.push_back(buffer);
        state.queued_bytes += size;
        state.total_pushed += 1;
        drop(state);
        self.inner.data_available.notify_one();
        FlowReturn::Ok
    }

    /// Pipeline side: wait up to `timeout` for the next buffer
    pub fn pull(&self, timeout: Duration) -> Option<FrameBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.queue.is_empty() && !state.flushing {
            if self
                .inner
                .data_available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }

        let mut buffer = state.queue.pop_front()?;
        let size = buffer.size().unwrap_or(0);
        buffer.unmap();
        state.queued_bytes = state.queued_bytes.saturating_sub(size);
        drop(state);
        self.inner.space_available.notify_one();
        Some(buffer)
    }

    /// Pipeline side: start or stop accepting data
    ///
    /// Entering flushing drops everything queued and wakes blocked pushers.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.inner.state.lock();
        state.flushing = flushing;
        if flushing {
            state.queue.clear();
            state.queued_bytes = 0;
        } else {
            state.eos = false;
        }
        drop(state);
        self.inner.space_available.notify_all();
        self.inner.data_available.notify_all();
    }

    /// Application side: no more buffers will follow
    pub fn end_of_stream(&self) {
        self.inner.state.lock().eos = true;
        self.inner.space_available.notify_all();
        self.inner.data_available.notify_all();
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.state.lock().flushing
    }

    /// Whether end-of-stream was signalled and every buffer was pulled
    pub fn is_drained(&self) -> bool {
        let state = self.inner.state.lock();
        state.eos && state.queue.is_empty()
    }

    pub fn set_caps(&self, caps: Caps) {
        self.inner.state.lock().caps = Some(caps);
    }

    pub fn caps(&self) -> Option<Caps> {
        self.inner.state.lock().caps.clone()
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn total_pushed(&self) -> u64 {
        self.inner.state.lock().total_pushed
    }
}

/// A processed unit delivered by the pipeline
///
/// The sample owns its buffer; releasing the sample returns the buffer to
/// the pipeline's pool.
pub struct Sample {
    buffer: FrameBuffer,
    caps: Option<Caps>,
}

impl Sample {
    pub fn new(buffer: FrameBuffer, caps: Option<Caps>) -> Self {
        Self { buffer, caps }
    }

    /// Borrowed view of the sample's buffer
    pub fn buffer(&self) -> Result<FrameBuffer> {
        Ok(FrameBuffer::borrowed(&self.buffer.native()?))
    }

    pub fn caps(&self) -> Option<&Caps> {
        self.caps.as_ref()
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("buffer", &self.buffer)
            .field("caps", &self.caps.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

/// What the egress port hands to its callback
#[derive(Debug)]
pub enum EgressItem {
    /// A processed sample
    Sample(Sample),
    /// The stream ended; no sample follows
    EndOfStream,
}

/// Callback invoked on the pipeline's delivery thread
pub type EgressCallback = Arc<dyn Fn(EgressItem) -> FlowReturn + Send + Sync>;

struct EgressInner {
    callback: RwLock<Option<EgressCallback>>,
    caps: Mutex<Option<Caps>>,
    total_delivered: AtomicU64,
}

/// Pipeline-to-application port
#[derive(Clone)]
pub struct EgressPort {
    inner: Arc<EgressInner>,
}

impl EgressPort {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EgressInner {
                callback: RwLock::new(None),
                caps: Mutex::new(None),
                total_delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Register the delivery callback, replacing any previous one
    pub fn set_callback(&self, callback: EgressCallback) {
        *self.inner.callback.write() = Some(callback);
    }

    /// Pipeline side: deliver a processed sample
    ///
    /// Without a registered callback the sample is dropped.
    pub fn push_sample(&self, sample: Sample) -> FlowReturn {
        self.inner.total_delivered.fetch_add(1, Ordering::Relaxed);
        self.dispatch(EgressItem::Sample(sample))
    }

    /// Pipeline side: signal end-of-stream
    pub fn end_of_stream(&self) -> FlowReturn {
        self.dispatch(EgressItem::EndOfStream)
    }

    /// Pipeline side: record the negotiated output format
    pub fn set_caps(&self, caps: Caps) {
        *self.inner.caps.lock() = Some(caps);
    }

    pub fn caps(&self) -> Option<Caps> {
        self.inner.caps.lock().clone()
    }

    pub fn total_delivered(&self) -> u64 {
        self.inner.total_delivered.load(Ordering::Relaxed)
    }

    fn dispatch(&self, item: EgressItem) -> FlowReturn {
        let callback = self.inner.callback.read().clone();
        match callback {
            Some(callback) => callback(item),
            None => {
                debug!("EgressPort: no callback registered, dropping {:?}", item);
                FlowReturn::Ok
            }
        }
    }
}

impl Default for EgressPort {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ingest() -> IngestPort {
        IngestPort::new(16, Duration::from_millis(10))
    }

    #[test]
    fn test_ingest_flushing_until_started() {
        let port = ingest();
        assert_eq!(port.push_buffer(FrameBuffer::zeroed(4)), FlowReturn::Flushing);

        port.set_flushing(false);
        assert_eq!(port.push_buffer(FrameBuffer::zeroed(4)), FlowReturn::Ok);
        assert_eq!(port.queued(), 1);
        assert_eq!(port.total_pushed(), 1);
    }

    #[test]
    fn test_ingest_blocks_over_max_bytes() {
        let port = ingest();
        port.set_flushing(false);
        assert!(port.push_buffer(FrameBuffer::zeroed(16)).is_ok());

        let pusher = port.clone();
        let handle = thread::spawn(move || pusher.push_buffer(FrameBuffer::zeroed(8)));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(port.queued(), 1);

        let mut pulled = port.pull(Duration::from_millis(10)).unwrap();
        assert_eq!(pulled.size().unwrap(), 16);
        assert_eq!(handle.join().unwrap(), FlowReturn::Ok);
        assert_eq!(port.queued(), 1);
    }

    #[test]
    fn test_ingest_flushing_wakes_blocked_push() {
        let port = ingest();
        port.set_flushing(false);
        port.push_buffer(FrameBuffer::zeroed(16));

        let pusher = port.clone();
        let handle = thread::spawn(move || pusher.push_buffer(FrameBuffer::zeroed(1)));
        thread::sleep(Duration::from_millis(20));

        port.set_flushing(true);
        assert_eq!(handle.join().unwrap(), FlowReturn::Flushing);
        assert_eq!(port.queued(), 0);
    }

    #[test]
    fn test_ingest_eos() {
        let port = ingest();
        port.set_flushing(false);
        port.push_buffer(FrameBuffer::zeroed(1));
        port.end_of_stream();

        assert_eq!(port.push_buffer(FrameBuffer::zeroed(1)), FlowReturn::Eos);
        assert!(!port.is_drained());
        assert!(port.pull(Duration::from_millis(10)).is_some());
        assert!(port.is_drained());
    }

    #[test]
    fn test_egress_dispatches_to_callback() {
        let port = EgressPort::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        port.set_callback(Arc::new(move |item| {
            sink.lock().push(matches!(item, EgressItem::Sample(_)));
            FlowReturn::Ok
        }));

        let sample = Sample::new(FrameBuffer::zeroed(2), None);
        assert!(port.push_sample(sample).is_ok());
        assert!(port.end_of_stream().is_ok());
        assert_eq!(*seen.lock(), vec![true, false]);
        assert_eq!(port.total_delivered(), 1);
    }

    #[test]
    fn test_sample_view_is_borrowed() {
        let sample = Sample::new(FrameBuffer::from_slice(b"abc"), None);
        let mut view = sample.buffer().unwrap();
        assert!(!view.owns());
        assert_eq!(view.map_read().unwrap(), b"abc");
        view.unmap();

        drop(sample);
        assert!(view.map_read().is_err());
    }
}
