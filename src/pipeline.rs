/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The decode pipeline core: worker thread lifecycle, the main processing
//! loop, the per-item decode step protocol and the resolution-change state
//! machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::buffer::{FrameGeometry, OutputBufferManager, PixelBuffer};
use crate::color::{AspectsPublisher, AspectsSnapshot, AspectsTracker, ColorAspects};
use crate::engine::{DecodeEngine, DecodeRequest, DecodeResponse, EngineFactory, OutputPlanes, StructuralEvent};
use crate::error::{PipelineError, Result, WorkError};
use crate::pending::PendingTable;
use crate::queue::WorkQueue;
use crate::work::{CompletionSink, DecodedOutput, WorkItem, WorkStatus};

/// How long `stop()` waits for the worker to exit before giving up.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 500;

/// Consecutive engine resets tolerated on one work item without any input
/// consumed before the item is failed.
const MAX_RESETS_PER_ITEM: u32 = 3;

/// Pipeline construction parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Geometry assumed before the bitstream reports one.
    pub initial_geometry: FrameGeometry,
    /// Caller-preferred color aspects; specified fields win over the
    /// bitstream-reported values.
    pub preferred_aspects: ColorAspects,
    /// Bound on the cooperative shutdown wait in `stop()`.
    pub stop_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            initial_geometry: FrameGeometry::default(),
            preferred_aspects: ColorAspects::default(),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

/// Worker thread lifecycle. `Stopped -> Running` only happens through a
/// fresh `start()`, and nothing skips `StopRequested` on the way down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    NotStarted,
    Running,
    StopRequested,
    Stopped,
}

/// Observable processing state, mutated only by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Decoding,
    Flushing,
    ResolutionChanging,
}

/// The resolution-change machine. No new compressed input reaches the
/// engine while draining or resetting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResizeState {
    Normal,
    DrainingForResize,
    Resetting,
}

/// Counters exposed for callers polling pipeline progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub queued: usize,
    pub pending: usize,
    pub delivered: u64,
    pub failed: u64,
}

/// State shared between the pipeline handle and its worker thread.
struct Shared {
    queue: WorkQueue,
    pending: Mutex<PendingTable>,
    aspects: AspectsPublisher,
    /// Cooperative exit request, observed at the top of each worker pass.
    exit_requested: AtomicBool,
    /// Liveness flag owned by the worker.
    worker_live: AtomicBool,
    /// Permanent error flag; once set, no further decode work is attempted.
    fatal: Mutex<Option<PipelineError>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            queue: WorkQueue::default(),
            pending: Mutex::new(PendingTable::default()),
            aspects: AspectsPublisher::default(),
            exit_requested: AtomicBool::new(false),
            worker_live: AtomicBool::new(false),
            fatal: Mutex::new(None),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn fatal_error(&self) -> Option<PipelineError> {
        self.fatal.lock().unwrap().clone()
    }

    /// Records the first fatal error; later ones keep the original cause.
    fn set_fatal(&self, error: PipelineError) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            error!("pipeline entered fatal state: {error}");
            *fatal = Some(error);
        }
    }
}

/// The asynchronous decode pipeline.
///
/// One dedicated worker thread drains the work queue, drives the decode
/// engine and hands completed items to the completion sink. The handle side
/// (`queue`, `flush`, `drain`, `start`, `stop`) is safe to call from any
/// thread.
///
/// After `stop()` returns `Timeout` the instance must be discarded;
/// restarting it is unsupported.
pub struct DecodePipeline {
    shared: Arc<Shared>,
    sink: Arc<dyn CompletionSink>,
    factory: Arc<Mutex<Box<dyn EngineFactory>>>,
    config: PipelineConfig,
    status: Mutex<WorkerStatus>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DecodePipeline {
    pub fn new(
        factory: Box<dyn EngineFactory>,
        sink: Arc<dyn CompletionSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            sink,
            factory: Arc::new(Mutex::new(factory)),
            config,
            status: Mutex::new(WorkerStatus::NotStarted),
            join: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Idempotent while running.
    pub fn start(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap();
        match *status {
            WorkerStatus::Running => return Ok(()),
            WorkerStatus::StopRequested => return Err(PipelineError::NotRunning),
            WorkerStatus::NotStarted | WorkerStatus::Stopped => {}
        }

        self.shared.exit_requested.store(false, Ordering::SeqCst);
        self.shared.worker_live.store(true, Ordering::SeqCst);

        let mut worker = Worker::new(
            self.shared.clone(),
            self.sink.clone(),
            self.factory.clone(),
            self.config.clone(),
        );
        let handle = thread::Builder::new()
            .name("decode-pipeline-worker".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.worker_live.store(false, Ordering::SeqCst);
                PipelineError::InitFailed(format!("failed to spawn worker: {e}"))
            })?;

        *self.join.lock().unwrap() = Some(handle);
        *status = WorkerStatus::Running;
        info!("pipeline worker started");
        Ok(())
    }

    /// Requests cooperative exit and waits up to the configured bound,
    /// waking the queue condition on every poll so the worker is never left
    /// waiting past the deadline.
    ///
    /// A `Timeout` is fatal to the instance's reusability guarantee.
    pub fn stop(&self) -> Result<()> {
        {
            let mut status = self.status.lock().unwrap();
            match *status {
                WorkerStatus::Running => *status = WorkerStatus::StopRequested,
                WorkerStatus::StopRequested => {}
                WorkerStatus::NotStarted | WorkerStatus::Stopped => return Ok(()),
            }
        }

        self.shared.exit_requested.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(self.config.stop_timeout_ms);
        while self.shared.worker_live.load(Ordering::SeqCst) && Instant::now() < deadline {
            self.shared.queue.notify_all();
            thread::sleep(Duration::from_millis(1));
        }

        if self.shared.worker_live.load(Ordering::SeqCst) {
            let timeout = PipelineError::Timeout(self.config.stop_timeout_ms);
            self.shared.set_fatal(timeout.clone());
            return Err(timeout);
        }

        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.status.lock().unwrap() = WorkerStatus::Stopped;
        // A clean stop clears the error latch so a fresh start() can
        // reinitialize the engine from scratch.
        *self.shared.fatal.lock().unwrap() = None;
        info!("pipeline worker stopped");
        Ok(())
    }

    /// Stops the worker if needed and clears any latched error so the
    /// instance can be started again.
    pub fn reset(&self) -> Result<()> {
        if self.is_running() {
            self.stop()?;
        }
        *self.shared.fatal.lock().unwrap() = None;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.worker_live.load(Ordering::SeqCst)
    }

    /// Appends work items to the queue. Fails when the worker is inactive.
    pub fn queue(&self, items: Vec<WorkItem>) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        self.shared.queue.append(items);
        Ok(())
    }

    /// Synchronously returns every queued and in-flight item without
    /// decoding it further. No item is lost; none is decoded after this
    /// call observes it.
    pub fn flush(&self) -> Result<Vec<WorkItem>> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        let mut flushed = self.shared.queue.drain_all();
        flushed.extend(self.shared.pending.lock().unwrap().drain_all());
        debug!("flushed {} work items", flushed.len());
        Ok(flushed)
    }

    /// Marks the end of the current stream segment on the last queued item.
    pub fn drain(&self) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        self.shared.queue.mark_drain();
        Ok(())
    }

    /// Latest finalized color aspects, as a versioned immutable snapshot.
    pub fn color_aspects(&self) -> Arc<AspectsSnapshot> {
        self.shared.aspects.snapshot()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queued: self.shared.queue.len(),
            pending: self.shared.pending.lock().unwrap().len(),
            delivered: self.shared.delivered.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.shared.exit_requested.store(true, Ordering::SeqCst);
        self.shared.queue.notify_all();
        if let Some(handle) = self.join.lock().unwrap().take() {
            // Only join a worker that has already wound down; a hung engine
            // must not turn drop into a deadlock.
            if !self.shared.worker_live.load(Ordering::SeqCst) {
                let _ = handle.join();
            }
        }
    }
}

/// Outcome of processing one work item.
enum ProcessOutcome {
    /// The item already reached the completion sink.
    Delivered,
    /// The item awaits a matching output and belongs in the pending table.
    Register(WorkItem),
}

/// Worker-thread-local state. The engine, the output buffers and the
/// geometry live here exclusively, so none of it needs a lock.
struct Worker {
    shared: Arc<Shared>,
    sink: Arc<dyn CompletionSink>,
    factory: Arc<Mutex<Box<dyn EngineFactory>>>,
    engine: Option<Box<dyn DecodeEngine>>,
    buffers: OutputBufferManager,
    geometry: FrameGeometry,
    aspects: AspectsTracker,
    state: PipelineState,
    resize: ResizeState,
    /// An end-of-stream flush is pending and runs at the top of the next
    /// pass.
    eos_flush: bool,
    /// End-of-stream was observed on input for the current segment.
    received_eos: bool,
    /// At least one frame was decoded since the engine was (re)initialized;
    /// gates the drain-before-reset on resolution changes.
    frame_decoded: bool,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        sink: Arc<dyn CompletionSink>,
        factory: Arc<Mutex<Box<dyn EngineFactory>>>,
        config: PipelineConfig,
    ) -> Self {
        let geometry = config.initial_geometry;
        let aspects = AspectsTracker::new(config.preferred_aspects);
        Self {
            shared,
            sink,
            factory,
            engine: None,
            buffers: OutputBufferManager::default(),
            geometry,
            aspects,
            state: PipelineState::Idle,
            resize: ResizeState::Normal,
            eos_flush: false,
            received_eos: false,
            frame_decoded: false,
        }
    }

    fn run(&mut self) {
        debug!("worker loop entered");
        while !self.shared.exit_requested.load(Ordering::SeqCst) {
            self.process_queue();
        }
        // Shutdown: nothing in the pending table may leak.
        let leftovers = self.shared.pending.lock().unwrap().drain_all();
        for mut item in leftovers {
            item.fail(WorkError::Flushed);
            self.deliver(item);
        }
        self.shared.worker_live.store(false, Ordering::SeqCst);
        debug!("worker loop exited");
    }

    /// One pass of the main loop: finish a pending end-of-stream flush,
    /// then dequeue and process exactly one item.
    fn process_queue(&mut self) {
        if let Some(error) = self.shared.fatal_error() {
            // The instance failed permanently; fail queued items instead of
            // decoding so none is silently dropped.
            if let Some(mut item) = self.shared.queue.wait_pop() {
                debug!("refusing work {} in fatal state: {error}", item.ordinal);
                item.fail(WorkError::PipelineFailed);
                self.deliver(item);
            }
            return;
        }

        if self.eos_flush {
            self.run_eos_flush();
        }

        let Some(item) = self.shared.queue.wait_pop() else {
            self.state = PipelineState::Idle;
            return;
        };
        self.state = PipelineState::Decoding;

        match self.process_work(item) {
            ProcessOutcome::Delivered => {}
            ProcessOutcome::Register(item) => {
                let mut pending = self.shared.pending.lock().unwrap();
                if let Err(mut rejected) = pending.insert(item) {
                    drop(pending);
                    warn!(
                        "work ordinal {} collides with an in-flight item, failing it",
                        rejected.ordinal
                    );
                    rejected.fail(WorkError::DuplicateOrdinal);
                    self.deliver(rejected);
                }
            }
        }
    }

    /// Drains buffered frames after an end-of-stream into a scratch buffer
    /// until the engine reports no more output, then resets the per-stream
    /// counters so the next enqueue starts a clean segment.
    fn run_eos_flush(&mut self) {
        self.state = PipelineState::Flushing;
        if self.engine.is_none() {
            self.eos_flush = false;
            self.state = PipelineState::Idle;
            return;
        }

        let mut scratch = match PixelBuffer::allocate(self.geometry) {
            Ok(buffer) => buffer,
            Err(error) => {
                error!(
                    "could not allocate flush buffer of {} bytes: {error}",
                    self.geometry.frame_size()
                );
                self.eos_flush = false;
                self.state = PipelineState::Idle;
                return;
            }
        };

        let geometry = self.geometry;
        let engine = self.engine.as_mut().expect("engine checked above");
        if let Err(error) = engine.enter_flush() {
            warn!("engine refused flush mode: {error}");
        }
        loop {
            let (y, u, v) = scratch.planes_mut();
            let response = engine.decode(DecodeRequest {
                input: None,
                ordinal: 0,
                min_plane_sizes: [geometry.luma_size(), geometry.chroma_size(), geometry.chroma_size()],
                output: OutputPlanes { y, u, v },
            });
            if !response.output_present {
                break;
            }
            debug!("discarded drained picture for ordinal {}", response.ordinal);
        }

        if self.received_eos {
            // Stream-end signal: no output left after EOS.
            self.reset_plugin();
        }
        self.eos_flush = false;
        self.state = PipelineState::Idle;
    }

    /// Per-stream counters reset at segment boundaries.
    fn reset_plugin(&mut self) {
        self.received_eos = false;
    }

    fn ensure_engine(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let mut engine = self.factory.lock().unwrap().create()?;
        self.geometry.stride = self.geometry.width;
        if let Err(error) = engine.set_params(self.geometry.stride) {
            warn!("initial parameter setup failed: {error}");
        }
        self.engine = Some(engine);
        self.frame_decoded = false;
        Ok(())
    }

    /// One decode step against the current output buffer.
    fn decode_step(&mut self, input: Option<&[u8]>, ordinal: u64) -> Result<DecodeResponse> {
        let geometry = self.geometry;
        let buffer = self.buffers.acquire(geometry)?;
        buffer.check_fits(geometry)?;
        let (y, u, v) = buffer.planes_mut();
        let engine = self.engine.as_mut().expect("engine exists while decoding");
        Ok(engine.decode(DecodeRequest {
            input,
            ordinal,
            min_plane_sizes: [geometry.luma_size(), geometry.chroma_size(), geometry.chroma_size()],
            output: OutputPlanes { y, u, v },
        }))
    }

    /// Processes one work item through zero or more decode steps.
    fn process_work(&mut self, mut item: WorkItem) -> ProcessOutcome {
        if let Err(error) = self.ensure_engine() {
            self.shared.set_fatal(error);
            item.fail(WorkError::PipelineFailed);
            self.deliver(item);
            return ProcessOutcome::Delivered;
        }

        // Re-apply the dynamic parameters whenever the stride fell out of
        // step with the width (geometry changed since the last step).
        if self.geometry.stride != self.geometry.width {
            self.geometry.stride = self.geometry.width;
            let stride = self.geometry.stride;
            if let Err(error) = self.engine.as_mut().expect("engine ensured").set_params(stride) {
                warn!("failed to re-apply stride {stride}: {error}");
            }
        }

        let item_eos = item.is_end_of_stream();
        if item_eos {
            self.received_eos = true;
        }

        // Empty input carries flags only; complete it right away.
        if item.input.is_empty() {
            item.status = WorkStatus::Ok;
            self.deliver(item);
            if item_eos && !self.eos_flush {
                self.enter_eos_flush();
            }
            return ProcessOutcome::Delivered;
        }

        let input = std::mem::take(&mut item.input);
        let ordinal = item.ordinal;
        let mut slot = Some(item);
        let mut offset = 0usize;
        let mut resets = 0u32;

        while offset < input.len() {
            let response = match self.decode_step(Some(&input[offset..]), ordinal) {
                Ok(response) => response,
                Err(error) => return self.fail_step(slot, error),
            };

            match response.event {
                Some(StructuralEvent::UnsupportedGeometry) => {
                    self.shared.set_fatal(PipelineError::UnsupportedGeometry {
                        width: self.geometry.width,
                        height: self.geometry.height,
                    });
                    return self.fail_in_hand(slot);
                }
                Some(StructuralEvent::AllocationFailed) => {
                    self.shared.set_fatal(PipelineError::EngineAllocationFailure);
                    return self.fail_in_hand(slot);
                }
                Some(StructuralEvent::ResolutionChanged) => {
                    resets += 1;
                    if resets > MAX_RESETS_PER_ITEM {
                        warn!(
                            "work {ordinal} keeps tripping resolution changes without progress, failing it"
                        );
                        if let Some(mut item) = slot {
                            item.fail(WorkError::DecodeFailed);
                            self.deliver(item);
                        }
                        return ProcessOutcome::Delivered;
                    }
                    if let Err(error) = self.drain_and_reset() {
                        self.shared.set_fatal(error);
                        return self.fail_in_hand(slot);
                    }
                    if item_eos {
                        self.received_eos = true;
                    }
                    // Re-evaluate the same unconsumed bytes at the settled
                    // geometry.
                    continue;
                }
                None => {}
            }

            if let Some(reported) = response.color_aspects {
                if self.aspects.update_bitstream(reported) {
                    self.shared.aspects.publish(self.aspects.finalized());
                }
            }
            if response.frame_decoded {
                self.frame_decoded = true;
            }

            let geometry_changed = response.pic_width > 0
                && response.pic_height > 0
                && (response.pic_width != self.geometry.width
                    || response.pic_height != self.geometry.height);
            let aspects_changed = self.aspects.take_pending_notify();
            if geometry_changed {
                // The held buffer is stale; the next acquire reallocates.
                self.buffers.release();
                self.geometry.width = response.pic_width;
                self.geometry.height = response.pic_height;
                info!(
                    "stream settings changed: {}x{}{}",
                    self.geometry.width,
                    self.geometry.height,
                    if aspects_changed { " and color aspects" } else { "" }
                );
            } else if aspects_changed {
                info!("color aspects changed: {:?}", self.aspects.finalized());
            }

            if response.output_present {
                self.finish_output(response.ordinal, &mut slot);
            }

            if response.bytes_consumed == 0 && !response.output_present {
                warn!("engine made no progress on work {ordinal}, failing it");
                if let Some(mut item) = slot {
                    item.fail(WorkError::DecodeFailed);
                    self.deliver(item);
                }
                return ProcessOutcome::Delivered;
            }
            offset += response.bytes_consumed;
            if response.bytes_consumed > 0 {
                resets = 0;
            }
        }

        // EOS seen and flush sub-mode not entered while processing: enter it
        // now so buffered reference frames are drained before going idle.
        if self.received_eos && !self.eos_flush {
            self.enter_eos_flush();
        }

        match slot {
            Some(item) => ProcessOutcome::Register(item),
            None => ProcessOutcome::Delivered,
        }
    }

    /// Attaches a surfaced output to its owner and hands it to the sink.
    ///
    /// The owner is the item in hand when the ordinal matches it, otherwise
    /// the pending-table entry registered by an earlier pass.
    fn finish_output(&mut self, ordinal: u64, slot: &mut Option<WorkItem>) {
        let matched = if slot.as_ref().map(|w| w.ordinal) == Some(ordinal) {
            slot.take()
        } else {
            self.shared.pending.lock().unwrap().remove(ordinal)
        };
        let Some(mut item) = matched else {
            warn!("engine surfaced output for unknown ordinal {ordinal}");
            return;
        };
        let Some(buffer) = self.buffers.take() else {
            // A geometry switch invalidated the buffer in the same step the
            // output surfaced; the item goes back to waiting for the
            // re-decoded picture. A collision on the way back is a duplicate
            // ordinal and must surface as a failure, never a dropped item.
            warn!("output for ordinal {ordinal} surfaced without a buffer");
            let reinserted = self.shared.pending.lock().unwrap().insert(item);
            if let Err(mut rejected) = reinserted {
                rejected.fail(WorkError::DuplicateOrdinal);
                self.deliver(rejected);
            }
            return;
        };
        item.output = Some(DecodedOutput {
            buffer,
            ordinal,
            color_aspects: self.aspects.finalized(),
        });
        item.status = WorkStatus::Ok;
        self.deliver(item);
    }

    /// Runs the resolution-change machine: drain buffered frames at the old
    /// geometry (only when something was decoded since init), then reset the
    /// engine and re-apply the dynamic parameters.
    fn drain_and_reset(&mut self) -> Result<()> {
        self.state = PipelineState::ResolutionChanging;
        self.resize = ResizeState::DrainingForResize;
        info!(
            "resolution change reported, draining at {}x{}",
            self.geometry.width, self.geometry.height
        );

        if self.frame_decoded {
            if let Err(error) = self.engine.as_mut().expect("engine ensured").enter_flush() {
                warn!("engine refused flush mode for resize: {error}");
            }
            loop {
                let response = self.decode_step(None, 0)?;
                if !response.output_present {
                    break;
                }
                let mut nothing = None;
                self.finish_output(response.ordinal, &mut nothing);
            }
        }

        self.resize = ResizeState::Resetting;
        self.engine
            .as_mut()
            .expect("engine ensured")
            .reset()
            .map_err(|e| PipelineError::InitFailed(format!("engine reset failed: {e}")))?;
        self.reset_plugin();
        self.geometry.stride = self.geometry.width;
        let stride = self.geometry.stride;
        if let Err(error) = self.engine.as_mut().expect("engine ensured").set_params(stride) {
            warn!("failed to re-apply parameters after reset: {error}");
        }
        self.frame_decoded = false;
        self.resize = ResizeState::Normal;
        self.state = PipelineState::Decoding;
        Ok(())
    }

    fn enter_eos_flush(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            if let Err(error) = engine.enter_flush() {
                warn!("engine refused flush mode: {error}");
            }
        }
        self.eos_flush = true;
    }

    /// Fails the in-hand item after the pipeline entered a fatal state.
    fn fail_in_hand(&mut self, slot: Option<WorkItem>) -> ProcessOutcome {
        if let Some(mut item) = slot {
            item.fail(WorkError::PipelineFailed);
            self.deliver(item);
        }
        ProcessOutcome::Delivered
    }

    /// Fails the in-hand item for a single bad decode step; the instance
    /// keeps running.
    fn fail_step(&mut self, slot: Option<WorkItem>, error: PipelineError) -> ProcessOutcome {
        warn!("decode step failed: {error}");
        if let Some(mut item) = slot {
            item.fail(WorkError::DecodeFailed);
            self.deliver(item);
        }
        ProcessOutcome::Delivered
    }

    fn deliver(&self, item: WorkItem) {
        debug_assert!(
            !matches!(item.status, WorkStatus::Pending),
            "delivering an unresolved item"
        );
        match item.status {
            WorkStatus::Failed(_) => {
                self.shared.failed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {
                self.shared.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
        debug!(
            "work {} done ({:?}), state {:?}/{:?}",
            item.ordinal, item.status, self.state, self.resize
        );
        self.sink.on_work_done(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{ColorPrimaries, ColorRange};
    use crate::engine::MockEngine;
    use crate::work::WorkFlags;
    use std::collections::VecDeque;

    type SinkLog = Arc<Mutex<Vec<WorkItem>>>;

    fn collecting_sink() -> (SinkLog, Arc<dyn CompletionSink>) {
        let log: SinkLog = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        let sink: Arc<dyn CompletionSink> =
            Arc::new(move |item: WorkItem| writer.lock().unwrap().push(item));
        (log, sink)
    }

    fn mock_pipeline(sink: Arc<dyn CompletionSink>) -> DecodePipeline {
        let geometry = FrameGeometry::default();
        DecodePipeline::new(
            Box::new(move || Ok(Box::new(MockEngine::new(geometry)) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig::default(),
        )
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Consumes every input whole, decodes frames internally but never
    /// surfaces an output, so items accumulate in the pending table.
    struct SilentEngine;

    impl DecodeEngine for SilentEngine {
        fn decode(&mut self, request: DecodeRequest<'_>) -> DecodeResponse {
            DecodeResponse {
                bytes_consumed: request.input.map_or(0, |i| i.len()),
                frame_decoded: request.input.is_some(),
                ..Default::default()
            }
        }

        fn set_params(&mut self, _stride: u32) -> Result<()> {
            Ok(())
        }

        fn enter_flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Replays a fixed list of responses, one per decode call, and records
    /// the input length seen by each call (`None` for flush steps).
    struct ScriptedEngine {
        script: VecDeque<DecodeResponse>,
        calls: Arc<Mutex<Vec<Option<usize>>>>,
    }

    impl DecodeEngine for ScriptedEngine {
        fn decode(&mut self, request: DecodeRequest<'_>) -> DecodeResponse {
            self.calls.lock().unwrap().push(request.input.map(|i| i.len()));
            self.script.pop_front().unwrap_or_default()
        }

        fn set_params(&mut self, _stride: u32) -> Result<()> {
            Ok(())
        }

        fn enter_flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Replays responses like `ScriptedEngine` but also records every engine
    /// call, control calls included, to verify call ordering.
    struct SequenceEngine {
        script: VecDeque<DecodeResponse>,
        ops: Arc<Mutex<Vec<String>>>,
    }

    impl DecodeEngine for SequenceEngine {
        fn decode(&mut self, request: DecodeRequest<'_>) -> DecodeResponse {
            let tag = match request.input {
                Some(input) => format!("decode:{}", input.len()),
                None => "drain".to_string(),
            };
            self.ops.lock().unwrap().push(tag);
            self.script.pop_front().unwrap_or_default()
        }

        fn set_params(&mut self, stride: u32) -> Result<()> {
            self.ops.lock().unwrap().push(format!("set_params:{stride}"));
            Ok(())
        }

        fn enter_flush(&mut self) -> Result<()> {
            self.ops.lock().unwrap().push("enter_flush".to_string());
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            self.ops.lock().unwrap().push("reset".to_string());
            Ok(())
        }
    }

    /// Reports a resolution change on every step, consuming nothing.
    struct ResizeLoopEngine;

    impl DecodeEngine for ResizeLoopEngine {
        fn decode(&mut self, _request: DecodeRequest<'_>) -> DecodeResponse {
            DecodeResponse {
                event: Some(StructuralEvent::ResolutionChanged),
                ..Default::default()
            }
        }

        fn set_params(&mut self, _stride: u32) -> Result<()> {
            Ok(())
        }

        fn enter_flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Never returns from a decode step; exercises the shutdown deadline.
    struct HungEngine;

    impl DecodeEngine for HungEngine {
        fn decode(&mut self, _request: DecodeRequest<'_>) -> DecodeResponse {
            thread::sleep(Duration::from_secs(2));
            DecodeResponse::default()
        }

        fn set_params(&mut self, _stride: u32) -> Result<()> {
            Ok(())
        }

        fn enter_flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn queue_fails_when_not_running() {
        let (_log, sink) = collecting_sink();
        let pipeline = mock_pipeline(sink);
        let err = pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap_err();
        assert_eq!(err, PipelineError::NotRunning);
        assert!(pipeline.flush().is_err());
        assert!(pipeline.drain().is_err());
    }

    #[test]
    fn single_eos_item_is_decoded_and_delivered_once() {
        let (log, sink) = collecting_sink();
        let pipeline = mock_pipeline(sink);
        pipeline.start().unwrap();

        let item = WorkItem::new(vec![0xAB; 100], 1).with_flags(WorkFlags::END_OF_STREAM);
        pipeline.queue(vec![item]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);

        let done = log.lock().unwrap();
        assert_eq!(done[0].status, WorkStatus::Ok);
        let output = done[0].output.as_ref().unwrap();
        assert_eq!(output.ordinal, 1);
        assert_eq!(output.buffer.len(), FrameGeometry::default().frame_size());
        // MockEngine stamps the luma plane with the ordinal.
        assert_eq!(output.buffer.data()[0], 1);
        drop(done);

        let stats = pipeline.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn empty_eos_item_completes_without_output() {
        let (log, sink) = collecting_sink();
        let pipeline = mock_pipeline(sink);
        pipeline.start().unwrap();

        pipeline
            .queue(vec![WorkItem::new(vec![], 1).with_flags(WorkFlags::END_OF_STREAM)])
            .unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);

        let done = log.lock().unwrap();
        assert_eq!(done[0].status, WorkStatus::Ok);
        assert!(done[0].output.is_none());
        drop(done);
        pipeline.stop().unwrap();
    }

    #[test]
    fn drain_ends_the_segment_and_later_items_still_decode() {
        let (log, sink) = collecting_sink();
        let pipeline = mock_pipeline(sink);
        pipeline.start().unwrap();

        pipeline
            .queue(vec![WorkItem::new(vec![1; 8], 1), WorkItem::new(vec![2; 8], 2)])
            .unwrap();
        pipeline.drain().unwrap();
        pipeline.queue(vec![WorkItem::new(vec![3; 8], 3)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 3);

        let done = log.lock().unwrap();
        assert!(done.iter().all(|w| w.status == WorkStatus::Ok));
        let ordinals: Vec<u64> = done.iter().map(|w| w.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        drop(done);
        pipeline.stop().unwrap();
    }

    #[test]
    fn flush_returns_every_undelivered_item() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Ok(Box::new(SilentEngine) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline
            .queue(vec![
                WorkItem::new(vec![1; 8], 1),
                WorkItem::new(vec![2; 8], 2),
                WorkItem::new(vec![3; 8], 3),
            ])
            .unwrap();
        wait_until(|| pipeline.stats().pending == 3);

        let flushed = pipeline.flush().unwrap();
        assert_eq!(flushed.len(), 3);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats().pending, 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn shutdown_fails_pending_items_to_the_sink() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Ok(Box::new(SilentEngine) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline
            .queue(vec![WorkItem::new(vec![1; 8], 1), WorkItem::new(vec![2; 8], 2)])
            .unwrap();
        wait_until(|| pipeline.stats().pending == 2);
        pipeline.stop().unwrap();

        let done = log.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert!(done
            .iter()
            .all(|w| w.status == WorkStatus::Failed(WorkError::Flushed)));
    }

    #[test]
    fn duplicate_ordinal_fails_the_new_item() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Ok(Box::new(SilentEngine) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![1; 8], 9)]).unwrap();
        wait_until(|| pipeline.stats().pending == 1);
        pipeline.queue(vec![WorkItem::new(vec![2; 8], 9)]).unwrap();
        wait_until(|| !log.lock().unwrap().is_empty());

        let done = log.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, WorkStatus::Failed(WorkError::DuplicateOrdinal));
        drop(done);
        // The first registration survived.
        assert_eq!(pipeline.stats().pending, 1);
        pipeline.stop().unwrap();
    }

    #[test]
    fn resolution_change_preserves_unconsumed_input() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let script: Vec<DecodeResponse> = vec![
            // Item 1 decodes in one step at the initial geometry.
            DecodeResponse {
                bytes_consumed: 50,
                output_present: true,
                frame_decoded: true,
                ordinal: 1,
                pic_width: 320,
                pic_height: 240,
                ..Default::default()
            },
            // Item 2 trips the resolution change before consuming anything.
            DecodeResponse {
                event: Some(StructuralEvent::ResolutionChanged),
                ..Default::default()
            },
            // Drain step: nothing buffered.
            DecodeResponse::default(),
            // Item 2 retried from the start: new dimensions, header consumed.
            DecodeResponse {
                bytes_consumed: 20,
                frame_decoded: true,
                pic_width: 640,
                pic_height: 480,
                ..Default::default()
            },
            // Remainder of item 2 produces the picture at the new geometry.
            DecodeResponse {
                bytes_consumed: 40,
                output_present: true,
                frame_decoded: true,
                ordinal: 2,
                pic_width: 640,
                pic_height: 480,
                ..Default::default()
            },
        ];
        let engine_calls = calls.clone();
        let mut scripts = VecDeque::from(script);
        let factory = Box::new(move || {
            Ok(Box::new(ScriptedEngine {
                script: std::mem::take(&mut scripts),
                calls: engine_calls.clone(),
            }) as Box<dyn DecodeEngine>)
        });

        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(factory, sink, PipelineConfig::default());
        pipeline.start().unwrap();

        pipeline
            .queue(vec![WorkItem::new(vec![0; 50], 1), WorkItem::new(vec![0; 60], 2)])
            .unwrap();
        wait_until(|| log.lock().unwrap().len() == 2);

        let done = log.lock().unwrap();
        assert_eq!(done[0].status, WorkStatus::Ok);
        assert_eq!(
            done[0].output.as_ref().unwrap().buffer.len(),
            FrameGeometry::new(320, 240).frame_size()
        );
        assert_eq!(done[1].status, WorkStatus::Ok);
        assert_eq!(
            done[1].output.as_ref().unwrap().buffer.len(),
            FrameGeometry::new(640, 480).frame_size()
        );
        drop(done);

        // The retried step saw all 60 bytes again: nothing was lost across
        // the drain and reset.
        let seen = calls.lock().unwrap();
        assert_eq!(*seen, vec![Some(50), Some(60), None, Some(60), Some(40)]);
        drop(seen);
        pipeline.stop().unwrap();
    }

    #[test]
    fn engine_reset_reapplies_parameters_before_resuming() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let script = vec![
            DecodeResponse {
                event: Some(StructuralEvent::ResolutionChanged),
                ..Default::default()
            },
            DecodeResponse {
                bytes_consumed: 8,
                output_present: true,
                frame_decoded: true,
                ordinal: 1,
                pic_width: 320,
                pic_height: 240,
                ..Default::default()
            },
        ];
        let engine_ops = ops.clone();
        let mut scripts = VecDeque::from(script);
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(move || {
                Ok(Box::new(SequenceEngine {
                    script: std::mem::take(&mut scripts),
                    ops: engine_ops.clone(),
                }) as Box<dyn DecodeEngine>)
            }),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);
        assert_eq!(log.lock().unwrap()[0].status, WorkStatus::Ok);

        // The reset tears the engine state down and the stride parameters
        // are re-applied before the item's bytes are fed again.
        let seen = ops.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["set_params:320", "decode:8", "reset", "set_params:320", "decode:8"]
        );
        drop(seen);
        pipeline.stop().unwrap();
    }

    #[test]
    fn colliding_output_without_buffer_is_failed_not_dropped() {
        // The first item parks at ordinal 9. The second reuses ordinal 9 and
        // its decode step reports a geometry switch together with an output
        // echoing 9, so no buffer is available and re-registration collides.
        let script = vec![
            DecodeResponse {
                bytes_consumed: 8,
                frame_decoded: true,
                ..Default::default()
            },
            DecodeResponse {
                bytes_consumed: 8,
                output_present: true,
                frame_decoded: true,
                ordinal: 9,
                pic_width: 640,
                pic_height: 480,
                ..Default::default()
            },
        ];
        let mut scripts = VecDeque::from(script);
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(move || {
                Ok(Box::new(ScriptedEngine {
                    script: std::mem::take(&mut scripts),
                    calls: Arc::new(Mutex::new(Vec::new())),
                }) as Box<dyn DecodeEngine>)
            }),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![1; 8], 9)]).unwrap();
        wait_until(|| pipeline.stats().pending == 1);
        pipeline.queue(vec![WorkItem::new(vec![2; 8], 9)]).unwrap();
        wait_until(|| !log.lock().unwrap().is_empty());

        // The colliding item reaches the sink as a failure instead of
        // vanishing; the parked item is still accounted for.
        let done = log.lock().unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, WorkStatus::Failed(WorkError::DuplicateOrdinal));
        drop(done);
        let stats = pipeline.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
        pipeline.stop().unwrap();
    }

    #[test]
    fn endless_resolution_changes_fail_the_item() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Ok(Box::new(ResizeLoopEngine) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);

        // The item fails instead of spinning the worker forever, and the
        // failure stays per-item.
        assert_eq!(
            log.lock().unwrap()[0].status,
            WorkStatus::Failed(WorkError::DecodeFailed)
        );
        assert!(pipeline.is_running());
        pipeline.stop().unwrap();
    }

    #[test]
    fn unsupported_geometry_is_fatal_and_fails_later_work() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| {
                Ok(Box::new(ScriptedEngine {
                    script: VecDeque::from(vec![DecodeResponse {
                        event: Some(StructuralEvent::UnsupportedGeometry),
                        ..Default::default()
                    }]),
                    calls: Arc::new(Mutex::new(Vec::new())),
                }) as Box<dyn DecodeEngine>)
            }),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);
        // Work queued after the failure is failed too, never decoded.
        pipeline.queue(vec![WorkItem::new(vec![0; 8], 2)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 2);

        let done = log.lock().unwrap();
        assert!(done
            .iter()
            .all(|w| w.status == WorkStatus::Failed(WorkError::PipelineFailed)));
        drop(done);
        assert_eq!(pipeline.stats().failed, 2);
        pipeline.stop().unwrap();
    }

    #[test]
    fn engine_init_failure_is_fatal() {
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Err(PipelineError::InitFailed("no codec".into()))),
            sink,
            PipelineConfig::default(),
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);
        assert_eq!(
            log.lock().unwrap()[0].status,
            WorkStatus::Failed(WorkError::PipelineFailed)
        );
        pipeline.stop().unwrap();
    }

    #[test]
    fn stop_times_out_on_a_hung_engine() {
        let (_log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(|| Ok(Box::new(HungEngine) as Box<dyn DecodeEngine>)),
            sink,
            PipelineConfig {
                stop_timeout_ms: 50,
                ..Default::default()
            },
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        // Let the worker enter the decode step before asking it to exit.
        thread::sleep(Duration::from_millis(100));
        let err = pipeline.stop().unwrap_err();
        assert_eq!(err, PipelineError::Timeout(50));
    }

    #[test]
    fn stop_start_cycle_reinitializes_the_engine() {
        let created = Arc::new(AtomicU64::new(0));
        let counter = created.clone();
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockEngine::new(FrameGeometry::default())) as Box<dyn DecodeEngine>)
            }),
            sink,
            PipelineConfig::default(),
        );

        pipeline.start().unwrap();
        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);
        pipeline.stop().unwrap();
        assert!(!pipeline.is_running());

        pipeline.start().unwrap();
        pipeline.queue(vec![WorkItem::new(vec![0; 8], 2)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 2);
        pipeline.stop().unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bitstream_aspects_are_merged_and_published() {
        let reported = ColorAspects::from_iso(1, 1, 1, true);
        let (log, sink) = collecting_sink();
        let pipeline = DecodePipeline::new(
            Box::new(move || {
                Ok(Box::new(ScriptedEngine {
                    script: VecDeque::from(vec![DecodeResponse {
                        bytes_consumed: 8,
                        output_present: true,
                        ordinal: 1,
                        frame_decoded: true,
                        color_aspects: Some(reported),
                        ..Default::default()
                    }]),
                    calls: Arc::new(Mutex::new(Vec::new())),
                }) as Box<dyn DecodeEngine>)
            }),
            sink,
            PipelineConfig {
                preferred_aspects: ColorAspects {
                    range: ColorRange::Limited,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        pipeline.start().unwrap();

        pipeline.queue(vec![WorkItem::new(vec![0; 8], 1)]).unwrap();
        wait_until(|| log.lock().unwrap().len() == 1);

        let snapshot = pipeline.color_aspects();
        assert_eq!(snapshot.version, 1);
        // The caller preference pins the range; the rest follows the stream.
        assert_eq!(snapshot.aspects.range, ColorRange::Limited);
        assert_eq!(snapshot.aspects.primaries, ColorPrimaries::Bt709);

        let done = log.lock().unwrap();
        let output = done[0].output.as_ref().unwrap();
        assert_eq!(output.color_aspects.range, ColorRange::Limited);
        assert_eq!(output.color_aspects.primaries, ColorPrimaries::Bt709);
        drop(done);
        pipeline.stop().unwrap();
    }
}
