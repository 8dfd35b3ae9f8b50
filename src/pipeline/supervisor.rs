//! Lifecycle, status monitoring and stall recovery of the external pipeline
//!
//! The supervisor owns the [`CorrespondenceBridge`], the ports and the
//! pipeline handle. Three threads meet here: the caller submitting and
//! popping frames, the pipeline's delivery thread running the egress
//! callback, and the status thread draining the pipeline's bus.
//!
//! # Watchdog
//!
//! There is no timer thread. Every `submit` checks how long ago the egress
//! side last delivered a sample. A submit made after more than the
//! watchdog timeout without delivery counts as stalled; after
//! `reset_count` consecutive stalled submits the pipeline is stopped and
//! started again and that submit reports failure. Any delivery resets the
//! count.
//!
//! # Failure
//!
//! An error reported by the pipeline, or an ordering violation found while
//! matching its output, marks the supervisor failed. Ingest stops accepting
//! frames, the next `submit` brings the pipeline down and every submit
//! reports failure until the caller runs `start()` again. The watchdog
//! leaves a failed pipeline alone.

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::bus::{MessageKind, MessageSource, StatusBus, StatusMessage};
use super::caps::Caps;
use super::clock::FrameClock;
use super::health::BridgeHealth;
use super::media::MediaPipeline;
use super::ports::{EgressCallback, EgressItem, EgressPort, FlowReturn, IngestPort};
use super::state::PipelineState;
use crate::bridge::{CorrespondenceBridge, QueueGuard};
use crate::buffer::{ClockTime, FrameBuffer};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::utils::sos::SignalOfStop;

/// Called with `(old, new, pending)` whenever the pipeline changed state
pub type StateChangeCallback =
    Arc<dyn Fn(PipelineState, PipelineState, Option<PipelineState>) + Send + Sync>;

const STATUS_KINDS: &[MessageKind] = &[
    MessageKind::Error,
    MessageKind::EndOfStream,
    MessageKind::StateChanged,
    MessageKind::Warning,
];

/// State touched by the egress callback and the status thread
struct Shared {
    state: RwLock<PipelineState>,
    state_callback: RwLock<Option<StateChangeCallback>>,
    last_error: Mutex<Option<String>>,
    fatal_error: Mutex<Option<Error>>,
    /// A sample is being handed over right now
    delivering: AtomicBool,
    /// Set on a pipeline error, cleared by `start()`
    failed: AtomicBool,
    stall_count: AtomicU32,
}

struct Ports {
    ingest: IngestPort,
    egress: EgressPort,
}

/// State only touched under the control lock
struct Control {
    ports: Option<Ports>,
    pipeline: Option<Box<dyn MediaPipeline>>,
    status_thread: Option<(SignalOfStop, JoinHandle<()>)>,
    frame_clock: FrameClock,
}

/// Supervises one external pipeline
pub struct PipelineSupervisor<T> {
    config: BridgeConfig,
    bridge: Arc<CorrespondenceBridge<T>>,
    health: Arc<BridgeHealth>,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl<T: Send + 'static> PipelineSupervisor<T> {
    pub fn new(config: BridgeConfig) -> Self {
        let health = Arc::new(BridgeHealth::new());
        let bridge = Arc::new(CorrespondenceBridge::new(&config, health.clone()));

        Self {
            bridge,
            health,
            shared: Arc::new(Shared {
                state: RwLock::new(PipelineState::Null),
                state_callback: RwLock::new(None),
                last_error: Mutex::new(None),
                fatal_error: Mutex::new(None),
                delivering: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                stall_count: AtomicU32::new(0),
            }),
            control: Mutex::new(Control {
                ports: None,
                pipeline: None,
                status_thread: None,
                frame_clock: FrameClock::new(config.frame_period()),
            }),
            config,
        }
    }

    /// Create the ports and build the pipeline around them
    ///
    /// `factory` receives the ingest and egress ports and returns the
    /// wired-up pipeline. Fails with [`Error::AlreadyInitialized`] on a
    /// second call.
    pub fn initialize<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce(&IngestPort, &EgressPort) -> Result<Box<dyn MediaPipeline>>,
    {
        let mut control = self.control.lock();
        if control.pipeline.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let ingest = IngestPort::new(self.config.ingest_max_bytes, self.config.push_poll_interval());
        let egress = EgressPort::new();
        egress.set_callback(self.egress_callback(ingest.clone()));

        let pipeline = factory(&ingest, &egress)?;
        info!("PipelineSupervisor: initialized pipeline {}", pipeline.name());

        control.ports = Some(Ports { ingest, egress });
        control.pipeline = Some(pipeline);
        Ok(())
    }

    fn egress_callback(&self, ingest: IngestPort) -> EgressCallback {
        let bridge = self.bridge.clone();
        let health = self.health.clone();
        let shared = self.shared.clone();

        Arc::new(move |item: EgressItem| {
            let is_sample = matches!(item, EgressItem::Sample(_));
            if is_sample {
                shared.delivering.store(true, Ordering::SeqCst);
            }

            let result = bridge.on_egress_result(item);

            // Every sample counts as a delivery, whatever the bridge made of it
            if is_sample {
                health.mark_delivery();
                shared.stall_count.store(0, Ordering::SeqCst);
                shared.delivering.store(false, Ordering::SeqCst);
            }

            match result {
                Ok(()) => FlowReturn::Ok,
                Err(e) => {
                    error!("PipelineSupervisor: fatal error while matching output: {}", e);
                    shared.failed.store(true, Ordering::SeqCst);
                    ingest.set_flushing(true);
                    bridge.set_drain_mode(true);
                    *shared.last_error.lock() = Some(e.to_string());
                    *shared.fatal_error.lock() = Some(e);
                    FlowReturn::Error
                }
            }
        })
    }

    /// Start the pipeline and the status thread
    ///
    /// A running pipeline is stopped first. Matched frames still queued and
    /// the user data of frames that never came back are dropped.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.start_locked(&mut control)
    }

    /// Stop the pipeline and join the status thread
    ///
    /// Blocked producers give up immediately. Calling this on a stopped
    /// pipeline does nothing.
    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock();
        if control.pipeline.is_none() {
            return Err(Error::NotInitialized);
        }
        self.stop_locked(&mut control);
        Ok(())
    }

    fn start_locked(&self, control: &mut Control) -> Result<()> {
        if control.pipeline.is_none() {
            return Err(Error::NotInitialized);
        }

        if control.status_thread.is_some() {
            self.stop_locked(control);
        }
        self.bridge.clear();
        self.bridge.reset_pending();
        self.bridge.set_drain_mode(false);
        self.shared.failed.store(false, Ordering::SeqCst);
        *self.shared.last_error.lock() = None;

        let (Some(ports), Some(pipeline)) = (control.ports.as_ref(), control.pipeline.as_mut()) else {
            return Err(Error::NotInitialized);
        };

        // Leftovers of the previous run must not end the new status thread
        pipeline.bus().flush();
        ports.ingest.set_flushing(false);
        if let Err(e) = pipeline.set_state(PipelineState::Playing) {
            ports.ingest.set_flushing(true);
            error!("PipelineSupervisor: unable to start {}: {}", pipeline.name(), e);
            return Err(e);
        }

        self.shared.stall_count.store(0, Ordering::SeqCst);
        self.health.mark_delivery();
        control.frame_clock.reset();

        let sos = SignalOfStop::new();
        let handle = spawn_status_thread(
            pipeline.bus(),
            ports.ingest.clone(),
            self.shared.clone(),
            sos.clone(),
            self.config.status_poll_interval(),
        )?;
        control.status_thread = Some((sos, handle));

        info!("PipelineSupervisor: pipeline started");
        Ok(())
    }

    /// Forward a frame into the pipeline
    ///
    /// Stamps synthetic timing derived from the nominal frame period and
    /// runs the watchdog first. Returns `Ok(false)` if the frame was not
    /// admitted, including when the watchdog just restarted the pipeline
    /// and while the pipeline is failed.
    pub fn submit(&self, buffer: FrameBuffer, user_data: T) -> Result<bool> {
        let (ingest, now) = {
            let mut control = self.control.lock();
            if control.pipeline.is_none() {
                return Err(Error::NotInitialized);
            }

            if self.shared.failed.load(Ordering::SeqCst) {
                if control.status_thread.is_some() {
                    warn!("PipelineSupervisor: pipeline failed, stopping it until restarted");
                    self.stop_locked(&mut control);
                }
                return Ok(false);
            }

            if control.status_thread.is_some() && self.watchdog_tripped() {
                warn!("PipelineSupervisor: pipeline watchdog activated, restarting pipeline");
                self.health.record_watchdog_restart();
                self.stop_locked(&mut control);
                self.start_locked(&mut control)?;
                return Ok(false);
            }

            let (Some(ports), Some(pipeline)) = (&control.ports, &control.pipeline) else {
                return Err(Error::NotInitialized);
            };
            let now = pipeline.clock_time();
            let ingest = ports.ingest.clone();
            buffer.set_timing(control.frame_clock.timing_at(now))?;
            (ingest, now)
        };

        let accepted = self.bridge.submit(&ingest, buffer, user_data)?;
        if accepted {
            self.control.lock().frame_clock.commit(now);
        }
        Ok(accepted)
    }

    /// Count this submit against the watchdog, `true` once it must fire
    fn watchdog_tripped(&self) -> bool {
        let watchdog = &self.config.watchdog;
        let stalled = !self.shared.delivering.load(Ordering::SeqCst)
            && self.health.is_stalled(watchdog.timeout());
        if !stalled {
            self.shared.stall_count.store(0, Ordering::SeqCst);
            return false;
        }

        let count = self.shared.stall_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("PipelineSupervisor: stalled submit {}/{}", count, watchdog.reset_count);
        count >= watchdog.reset_count
    }

    /// Block until a matched frame is available
    pub fn pop(&self) -> (FrameBuffer, T) {
        self.bridge.output().pop()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<(FrameBuffer, T)> {
        self.bridge.output().pop_timeout(timeout)
    }

    /// Hold the output queue lock
    ///
    /// Lets the caller wait on the queue's filled condition together with
    /// its own predicates, then pop with [`QueueGuard::pop_front`].
    pub fn lock_output(&self) -> QueueGuard<'_, (FrameBuffer, T)> {
        self.bridge.output().lock()
    }

    pub fn has_output(&self) -> bool {
        !self.bridge.output().is_empty()
    }

    pub fn available_output_count(&self) -> usize {
        self.bridge.output().len()
    }

    /// Register the state-change callback, replacing any previous one
    pub fn set_state_change_callback<F>(&self, callback: F)
    where
        F: Fn(PipelineState, PipelineState, Option<PipelineState>) + Send + Sync + 'static,
    {
        *self.shared.state_callback.write() = Some(Arc::new(callback));
    }

    /// Format negotiated on the egress side, if any
    pub fn get_output_caps(&self) -> Result<Option<Caps>> {
        let control = self.control.lock();
        let ports = control.ports.as_ref().ok_or(Error::NotInitialized)?;
        Ok(ports.egress.caps())
    }

    /// Format of the frames the caller is going to submit
    pub fn set_input_caps(&self, caps: Caps) -> Result<()> {
        let control = self.control.lock();
        let ports = control.ports.as_ref().ok_or(Error::NotInitialized)?;
        debug!("PipelineSupervisor: input caps {}", caps);
        ports.ingest.set_caps(caps);
        Ok(())
    }

    /// Pipeline state as last reported on the status bus
    pub fn state(&self) -> PipelineState {
        *self.shared.state.read()
    }

    /// Playing and not failed
    pub fn is_playing(&self) -> bool {
        !self.has_failed() && self.state().is_playing()
    }

    /// Whether the pipeline failed since the last `start()`
    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Message of the last error the pipeline reported since `start()`
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Take the error raised on the delivery thread, if any
    pub fn take_fatal_error(&self) -> Option<Error> {
        self.shared.fatal_error.lock().take()
    }

    pub fn health(&self) -> Arc<BridgeHealth> {
        self.health.clone()
    }

    /// Consecutive stalled submits seen by the watchdog
    pub fn stall_count(&self) -> u32 {
        self.shared.stall_count.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.bridge.pending_len()
    }

    pub fn ingest_port(&self) -> Option<IngestPort> {
        self.control.lock().ports.as_ref().map(|ports| ports.ingest.clone())
    }

    pub fn egress_port(&self) -> Option<EgressPort> {
        self.control.lock().ports.as_ref().map(|ports| ports.egress.clone())
    }

    /// Current time on the pipeline clock
    pub fn clock_time(&self) -> Result<ClockTime> {
        let control = self.control.lock();
        let pipeline = control.pipeline.as_ref().ok_or(Error::NotInitialized)?;
        Ok(pipeline.clock_time())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl<T> PipelineSupervisor<T> {
    fn stop_locked(&self, control: &mut Control) {
        self.bridge.set_drain_mode(true);
        let status = control.status_thread.take();
        if let Some((sos, _)) = &status {
            sos.cancel();
        }

        if let Some(ports) = &control.ports {
            ports.ingest.set_flushing(true);
        }
        if let Some(pipeline) = control.pipeline.as_mut() {
            debug!("PipelineSupervisor: setting {} to {}", pipeline.name(), PipelineState::Null);
            if let Err(e) = pipeline.set_state(PipelineState::Null) {
                warn!("PipelineSupervisor: {}", e);
            }
        }

        if let Some((_, handle)) = status {
            if handle.join().is_err() {
                error!("PipelineSupervisor: status thread panicked");
            }
        }

        // Mirror the transitions the status thread had no chance to see
        if let Some(pipeline) = control.pipeline.as_ref() {
            let bus = pipeline.bus();
            while let Some(message) = bus.timed_pop_filtered(Duration::ZERO, &[MessageKind::StateChanged]) {
                handle_status_message(&self.shared, message);
            }
        }
        info!("PipelineSupervisor: pipeline stopped");
    }
}

impl<T> Drop for PipelineSupervisor<T> {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        if control.status_thread.is_some() {
            self.stop_locked(&mut control);
        }
    }
}

fn spawn_status_thread(
    bus: StatusBus,
    ingest: IngestPort,
    shared: Arc<Shared>,
    sos: SignalOfStop,
    poll_interval: Duration,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("pipeline-status".to_string())
        .spawn(move || {
            while !sos.cancelled() {
                let Some(message) = bus.timed_pop_filtered(poll_interval, STATUS_KINDS) else {
                    continue;
                };
                if !handle_status_message(&shared, message) {
                    if shared.failed.load(Ordering::SeqCst) {
                        ingest.set_flushing(true);
                    }
                    break;
                }
            }
            debug!("PipelineSupervisor: status thread finished");
        })?;
    Ok(handle)
}

/// Apply one status message, `false` once monitoring must end
fn handle_status_message(shared: &Shared, message: StatusMessage) -> bool {
    match message {
        StatusMessage::Error {
            source,
            message,
            debug,
        } => {
            error!("Error received from {}: {}", source, message);
            if let Some(debug) = debug {
                error!("Debugging information: {}", debug);
            }
            shared.failed.store(true, Ordering::SeqCst);
            *shared.last_error.lock() = Some(message);
            false
        }
        StatusMessage::EndOfStream => {
            info!("End of stream reached");
            false
        }
        StatusMessage::StateChanged {
            source: MessageSource::Pipeline,
            old,
            new,
            pending,
        } => {
            *shared.state.write() = new;
            info!("Pipeline state changed from {} to {}", old, new);
            let callback = shared.state_callback.read().clone();
            if let Some(callback) = callback {
                callback(old, new, pending);
            }
            true
        }
        StatusMessage::StateChanged { .. } => true,
        other => {
            warn!("Unexpected message received: {:?}", other);
            true
        }
    }
}
