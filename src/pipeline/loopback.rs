//! In-process pipeline that hands every frame straight back
//!
//! A worker thread pulls from the ingest port, runs an optional byte
//! transform, copies the result into a buffer from its own pool together
//! with the input's metadata and delivers it on the egress port. Used by
//! the demo binary and the tests; [`LoopbackControl`] injects the faults a
//! real pipeline shows (dropped frames, stalls, lost metadata, errors).

use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::bus::{self, BusPoster, MessageSource, StatusBus, StatusMessage};
use super::clock::SystemClock;
use super::media::MediaPipeline;
use super::ports::{EgressPort, FlowReturn, IngestPort, Sample};
use super::state::PipelineState;
use crate::bridge::ReportThrottle;
use crate::buffer::{BufferPool, ClockTime, FrameBuffer};
use crate::error::{Error, Result};
use crate::utils::sos::SignalOfStop;

/// In-place transform applied to every frame
pub type Transform = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// Construction settings
#[derive(Clone)]
pub struct LoopbackOptions {
    pub name: String,
    /// Output buffers available to the worker
    pub pool_capacity: usize,
    /// How often the worker re-checks for frames and stop requests
    pub poll_interval: Duration,
    pub transform: Option<Transform>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            name: "loopback".to_string(),
            pool_capacity: 4,
            poll_interval: Duration::from_millis(10),
            transform: None,
        }
    }
}

struct ControlState {
    drop_every: AtomicU64,
    stalled: AtomicBool,
    strip_metadata: AtomicBool,
    refuse_playing: AtomicBool,
}

/// Runtime fault injection for a [`LoopbackPipeline`]
#[derive(Clone)]
pub struct LoopbackControl {
    state: Arc<ControlState>,
    poster: BusPoster,
}

impl LoopbackControl {
    /// Silently drop every `k`-th frame, `0` disables dropping
    pub fn set_drop_every(&self, k: u64) {
        self.state.drop_every.store(k, Ordering::Relaxed);
    }

    /// Stop (or resume) pulling frames from ingest
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::Relaxed);
    }

    /// Deliver frames without their correspondence metadata
    pub fn set_strip_metadata(&self, strip: bool) {
        self.state.strip_metadata.store(strip, Ordering::Relaxed);
    }

    /// Refuse transitions into `Playing`
    pub fn set_refuse_playing(&self, refuse: bool) {
        self.state.refuse_playing.store(refuse, Ordering::Relaxed);
    }

    /// Post an error message on the status bus
    pub fn inject_error(&self, message: impl Into<String>) {
        self.poster.post(StatusMessage::Error {
            source: MessageSource::Element("loopback-transform".to_string()),
            message: message.into(),
            debug: Some("injected".to_string()),
        });
    }

    fn drop_every(&self) -> u64 {
        self.state.drop_every.load(Ordering::Relaxed)
    }

    fn is_stalled(&self) -> bool {
        self.state.stalled.load(Ordering::Relaxed)
    }

    fn strips_metadata(&self) -> bool {
        self.state.strip_metadata.load(Ordering::Relaxed)
    }

    fn refuses_playing(&self) -> bool {
        self.state.refuse_playing.load(Ordering::Relaxed)
    }
}

/// Pipeline that loops ingest back to egress
pub struct LoopbackPipeline {
    options: LoopbackOptions,
    ingest: IngestPort,
    egress: EgressPort,
    poster: BusPoster,
    bus: StatusBus,
    clock: SystemClock,
    state: PipelineState,
    control: LoopbackControl,
    worker: Option<(SignalOfStop, JoinHandle<()>)>,
}

impl LoopbackPipeline {
    pub fn new(ingest: &IngestPort, egress: &EgressPort, options: LoopbackOptions) -> Self {
        let (poster, bus) = bus::channel();
        let control = LoopbackControl {
            state: Arc::new(ControlState {
                drop_every: AtomicU64::new(0),
                stalled: AtomicBool::new(false),
                strip_metadata: AtomicBool::new(false),
                refuse_playing: AtomicBool::new(false),
            }),
            poster: poster.clone(),
        };

        Self {
            options,
            ingest: ingest.clone(),
            egress: egress.clone(),
            poster,
            bus,
            clock: SystemClock::new(),
            state: PipelineState::Null,
            control,
            worker: None,
        }
    }

    /// Fault injection handle, usable after the pipeline was boxed away
    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }

    fn enter(&mut self, next: PipelineState) -> Result<()> {
        if self.state == PipelineState::Playing {
            self.stop_worker();
        }
        match next {
            PipelineState::Paused if self.state == PipelineState::Ready => {
                // Negotiation: output format follows the input format
                if let Some(caps) = self.ingest.caps() {
                    self.egress.set_caps(caps);
                }
            }
            PipelineState::Playing => self.spawn_worker()?,
            _ => {}
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let sos = SignalOfStop::new();
        let worker = Worker {
            ingest: self.ingest.clone(),
            egress: self.egress.clone(),
            poster: self.poster.clone(),
            control: self.control.clone(),
            sos: sos.clone(),
            options: self.options.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-worker", self.options.name))
            .spawn(move || worker.run())?;
        self.worker = Some((sos, handle));
        Ok(())
    }

    fn stop_worker(&mut self) {
        if let Some((sos, handle)) = self.worker.take() {
            sos.cancel();
            if handle.join().is_err() {
                warn!("LoopbackPipeline: worker thread panicked");
            }
        }
    }
}

impl MediaPipeline for LoopbackPipeline {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn set_state(&mut self, target: PipelineState) -> Result<()> {
        if target == PipelineState::Playing && self.control.refuses_playing() {
            return Err(Error::StateChange { target });
        }

        for next in self.state.path_to(target) {
            self.enter(next)?;
            let old = self.state;
            self.state = next;
            let pending = (next != target).then_some(target);

            self.poster.post(StatusMessage::StateChanged {
                source: MessageSource::Element(format!("{}-transform", self.options.name)),
                old,
                new: next,
                pending,
            });
            self.poster.post(StatusMessage::StateChanged {
                source: MessageSource::Pipeline,
                old,
                new: next,
                pending,
            });
        }
        Ok(())
    }

    fn bus(&self) -> StatusBus {
        self.bus.clone()
    }

    fn clock_time(&self) -> ClockTime {
        self.clock.now()
    }
}

impl Drop for LoopbackPipeline {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

struct Worker {
    ingest: IngestPort,
    egress: EgressPort,
    poster: BusPoster,
    control: LoopbackControl,
    sos: SignalOfStop,
    options: LoopbackOptions,
}

impl Worker {
    fn run(self) {
        let mut output_pool: Option<BufferPool> = None;
        let starvation_reports = ReportThrottle::new(10);
        let mut frame_index = 0u64;

        while !self.sos.cancelled() {
            if self.control.is_stalled() {
                self.sos.wait_timeout(self.options.poll_interval);
                continue;
            }

            let Some(mut input) = self.ingest.pull(self.options.poll_interval) else {
                if self.ingest.is_drained() {
                    info!("{}: end of stream", self.options.name);
                    self.egress.end_of_stream();
                    self.poster.post(StatusMessage::EndOfStream);
                    return;
                }
                if self.ingest.is_flushing() {
                    self.sos.wait_timeout(self.options.poll_interval);
                }
                continue;
            };

            frame_index += 1;
            let drop_every = self.control.drop_every();
            if drop_every > 0 && frame_index % drop_every == 0 {
                debug!("{}: dropping frame {}", self.options.name, frame_index);
                continue;
            }

            let size = match input.size() {
                Ok(size) => size,
                Err(e) => {
                    warn!("{}: unreadable input frame: {}", self.options.name, e);
                    continue;
                }
            };
            if output_pool.as_ref().is_none_or(|pool| pool.buffer_size() != size) {
                output_pool = Some(BufferPool::new(size, self.options.pool_capacity));
            }
            let Some(pool) = output_pool.as_ref() else {
                continue;
            };

            // Wait for the consumer side to hand a slot back
            let output = loop {
                if let Some(output) = pool.try_acquire() {
                    break output;
                }
                if starvation_reports.hit() {
                    warn!("{}: output pool exhausted", self.options.name);
                }
                if self.sos.wait_timeout(self.options.poll_interval) {
                    return;
                }
            };

            let output = match self.process(&mut input, output) {
                Ok(output) => output,
                Err(e) => {
                    warn!("{}: failed to process frame: {}", self.options.name, e);
                    continue;
                }
            };
            drop(input);

            match self.egress.push_sample(Sample::new(output, self.egress.caps())) {
                FlowReturn::Ok => {}
                FlowReturn::Error => {
                    self.poster.post(StatusMessage::Error {
                        source: MessageSource::Element(format!("{}-sink", self.options.name)),
                        message: "egress callback reported an error".to_string(),
                        debug: None,
                    });
                    return;
                }
                flow => debug!("{}: egress returned {:?}", self.options.name, flow),
            }
        }
    }

    fn process(&self, input: &mut FrameBuffer, mut output: FrameBuffer) -> Result<FrameBuffer> {
        let meta = input.meta()?;
        {
            let data = output.map_write()?;
            data.copy_from_slice(input.map_read()?);
            if let Some(transform) = &self.options.transform {
                transform(data);
            }
        }
        output.unmap();
        input.unmap();

        output.set_timing(meta.timing)?;
        if let Some(id) = meta.correspondence_id.filter(|_| !self.control.strips_metadata()) {
            output.set_correspondence_id(id)?;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::MessageKind;
    use crate::pipeline::ports::EgressItem;
    use parking_lot::Mutex;

    fn collecting_egress() -> (EgressPort, Arc<Mutex<Vec<(Vec<u8>, Option<u64>)>>>) {
        let egress = EgressPort::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        egress.set_callback(Arc::new(move |item| {
            if let EgressItem::Sample(sample) = item {
                let mut view = sample.buffer().unwrap();
                let id = view.correspondence_id().unwrap();
                sink.lock().push((view.map_read().unwrap().to_vec(), id));
            }
            FlowReturn::Ok
        }));
        (egress, seen)
    }

    fn wait_for(count: usize, seen: &Mutex<Vec<(Vec<u8>, Option<u64>)>>) {
        for _ in 0..200 {
            if seen.lock().len() >= count {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn tagged(bytes: &[u8], id: u64) -> FrameBuffer {
        let buffer = FrameBuffer::from_slice(bytes);
        buffer.set_correspondence_id(id).unwrap();
        buffer
    }

    #[test]
    fn test_frames_loop_back_with_metadata() {
        let ingest = IngestPort::new(1024, Duration::from_millis(10));
        let (egress, seen) = collecting_egress();
        let options = LoopbackOptions {
            transform: Some(Arc::new(|data: &mut [u8]| data.reverse())),
            ..LoopbackOptions::default()
        };
        let mut pipeline = LoopbackPipeline::new(&ingest, &egress, options);

        pipeline.set_state(PipelineState::Playing).unwrap();
        ingest.set_flushing(false);
        ingest.push_buffer(tagged(&[1, 2, 3], 7));
        wait_for(1, &seen);
        pipeline.set_state(PipelineState::Null).unwrap();

        assert_eq!(*seen.lock(), vec![(vec![3, 2, 1], Some(7))]);
    }

    #[test]
    fn test_drop_and_strip_knobs() {
        let ingest = IngestPort::new(1024, Duration::from_millis(10));
        let (egress, seen) = collecting_egress();
        let mut pipeline = LoopbackPipeline::new(&ingest, &egress, LoopbackOptions::default());
        let control = pipeline.control();
        control.set_drop_every(2);
        control.set_strip_metadata(true);

        pipeline.set_state(PipelineState::Playing).unwrap();
        ingest.set_flushing(false);
        for id in 0..4 {
            ingest.push_buffer(tagged(&[id as u8], id));
        }
        wait_for(2, &seen);
        pipeline.set_state(PipelineState::Null).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, id)| id.is_none()));
        assert_eq!(seen[0].0, vec![0]);
        assert_eq!(seen[1].0, vec![2]);
    }

    #[test]
    fn test_state_changes_are_posted_per_step() {
        let ingest = IngestPort::new(1024, Duration::from_millis(10));
        let egress = EgressPort::new();
        let mut pipeline = LoopbackPipeline::new(&ingest, &egress, LoopbackOptions::default());
        let bus = pipeline.bus();

        pipeline.set_state(PipelineState::Paused).unwrap();

        let mut steps = Vec::new();
        while let Some(StatusMessage::StateChanged { source, old, new, pending }) =
            bus.timed_pop_filtered(Duration::from_millis(10), &[MessageKind::StateChanged])
        {
            if source == MessageSource::Pipeline {
                steps.push((old, new, pending));
            }
        }
        assert_eq!(
            steps,
            vec![
                (PipelineState::Null, PipelineState::Ready, Some(PipelineState::Paused)),
                (PipelineState::Ready, PipelineState::Paused, None),
            ]
        );
    }

    #[test]
    fn test_refused_playing() {
        let ingest = IngestPort::new(1024, Duration::from_millis(10));
        let egress = EgressPort::new();
        let mut pipeline = LoopbackPipeline::new(&ingest, &egress, LoopbackOptions::default());
        pipeline.control().set_refuse_playing(true);

        assert!(matches!(
            pipeline.set_state(PipelineState::Playing),
            Err(Error::StateChange { target: PipelineState::Playing })
        ));
        assert!(pipeline.set_state(PipelineState::Ready).is_ok());
    }

    #[test]
    fn test_egress_error_is_posted() {
        let ingest = IngestPort::new(1024, Duration::from_millis(10));
        let egress = EgressPort::new();
        egress.set_callback(Arc::new(|_| FlowReturn::Error));
        let mut pipeline = LoopbackPipeline::new(&ingest, &egress, LoopbackOptions::default());
        let bus = pipeline.bus();

        pipeline.set_state(PipelineState::Playing).unwrap();
        ingest.set_flushing(false);
        ingest.push_buffer(FrameBuffer::zeroed(4));

        let message = bus.timed_pop_filtered(Duration::from_secs(1), &[MessageKind::Error]);
        assert!(matches!(message, Some(StatusMessage::Error { .. })));
        pipeline.set_state(PipelineState::Null).unwrap();
    }
}
