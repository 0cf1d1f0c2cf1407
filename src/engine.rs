//! Engine: instance table, ingestion queue and background consumer
//!
//! Producers call [`Engine::submit`] or [`Engine::submit_triple`] from any
//! thread. With a non-zero `queue_depth` the datum is pushed onto a bounded
//! queue and a single consumer thread (or [`Engine::process_queued`]) runs
//! the per-instance pipeline:
//!
//! ```text
//! rectify -> stability -> fusion -> stats
//!               |
//!               +-> calibration (stored points)
//! ```
//!
//! A `queue_depth` of zero runs the pipeline on the caller thread. Every
//! subsystem of an instance sits behind its own lock. A per-instance pass
//! lock, always taken first, is held for a whole pipeline pass and for a
//! calibration commit, so no datum sees half of a committed calibration.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use heapless::Deque;
use log::{debug, info, warn};

use crate::calibration::{CalibrationMode, CalibrationStatus, Calibrator, Verifier};
use crate::error::{Error, Result, Status, worst_of};
use crate::fusion::{Estimate, FusionCore, FusionOutcome};
use crate::lock;
use crate::rectify::Rectifier;
use crate::slab::{Handle, MAX_INSTANCES, Slab};
use crate::stability::{POINT_CAPACITY, PointCallback, StabilityDetector};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::types::{
    Datum, EngineConfig, FusionConfig, InstanceConfig, Pipeline, PointEntry, RectifyConfig,
    StabilityState, Subsystem, SubsystemConfig, Triple,
};

/// Compile-time queue capacity; `EngineConfig::queue_depth` may not exceed it
pub const QUEUE_CAPACITY: usize = 64;

/// Stored points copied out by [`Engine::points`]
pub type Points = heapless::Vec<PointEntry, POINT_CAPACITY>;

#[derive(Debug, Clone, Copy)]
enum Job {
    Single(Datum),
    Triple(Triple),
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    handle: Handle,
    job: Job,
}

/// One logical sensor unit and its subsystems
struct Instance {
    pipeline: Pipeline,
    /// Outermost lock: one pipeline pass or one calibration commit
    pass: Mutex<()>,
    rectifier: Mutex<Rectifier>,
    detector: Mutex<StabilityDetector>,
    stats: Mutex<StatsCollector>,
    calibrator: Mutex<Calibrator>,
    fusion: FusionCore,
}

impl Instance {
    fn new(config: InstanceConfig, pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            pass: Mutex::new(()),
            rectifier: Mutex::new(Rectifier::new(config.rectify)),
            detector: Mutex::new(StabilityDetector::new(config.stability)),
            stats: Mutex::new(StatsCollector::new(config.stats)),
            calibrator: Mutex::new(Calibrator::new(config.calibration)),
            fusion: FusionCore::new(config.fusion),
        }
    }

    fn rectify(&self, datum: Datum) -> (Datum, Status) {
        if !self.pipeline.rectify {
            return (datum, Status::Ok);
        }
        lock(&self.rectifier).correct(datum)
    }

    /// Stability detection plus calibration hand-off; returns whether the
    /// device is stable
    fn detect(&self, datum: Datum) -> (bool, Result<Status>) {
        if !self.pipeline.stability {
            return (false, Ok(Status::Ok));
        }
        let detection = lock(&self.detector).process(datum);
        let stable = detection.state == StabilityState::Stable;

        let mut result = Ok(detection.status);
        if let (Some(point), true) = (detection.point, self.pipeline.calibration) {
            let submitted = match lock(&self.calibrator).submit_point(&point) {
                Err(Error::NotCalibrating) => Ok(Status::Ok),
                other => other,
            };
            result = worst_of(result, submitted);
        }
        (stable, result)
    }

    fn collect(&self, datum: Datum, outcome: FusionOutcome, stable: bool) -> Status {
        if !self.pipeline.stats {
            return Status::Ok;
        }
        lock(&self.stats).collect(datum, outcome.fom, stable)
    }

    /// Full pipeline for one datum
    ///
    /// Every stage runs even when an earlier one reports an error; the most
    /// notable outcome is returned.
    fn run(&self, datum: Datum) -> Result<Status> {
        let (datum, rectified) = self.rectify(datum);
        let (stable, detected) = self.detect(datum);
        let outcome = self.fusion.update(datum);
        let collected = self.collect(datum, outcome, stable);

        let status = rectified.worst(outcome.status).worst(collected);
        worst_of(detected, Ok(status))
    }

    /// Full pipeline for a synchronized triple
    fn run_triple(&self, triple: Triple) -> Result<Status> {
        let mut status = Status::Ok;
        let mut detected = Ok(Status::Ok);
        let mut stable = [false; 3];

        let mut datums = triple.datums();
        for (datum, flag) in datums.iter_mut().zip(stable.iter_mut()) {
            let (corrected, rectified) = self.rectify(*datum);
            *datum = corrected;
            status = status.worst(rectified);

            let (is_stable, result) = self.detect(corrected);
            *flag = is_stable;
            detected = worst_of(detected, result);
        }

        let [gyro, accel, magn] = datums;
        let corrected = Triple::new(triple.tick, gyro.value, accel.value, magn.value);
        let outcomes = self.fusion.update_triple(corrected);

        for ((datum, outcome), stable) in datums.iter().zip(outcomes).zip(stable) {
            status = status.worst(outcome.status);
            status = status.worst(self.collect(*datum, outcome, stable));
        }
        worst_of(detected, Ok(status))
    }

    fn run_job(&self, job: Job) -> Result<Status> {
        let _pass = lock(&self.pass);
        match job {
            Job::Single(datum) => self.run(datum),
            Job::Triple(triple) => self.run_triple(triple),
        }
    }

    /// Install staged calibration configs between two pipeline passes
    fn commit(&self, rectify: RectifyConfig, fusion: FusionConfig) {
        let _pass = lock(&self.pass);
        lock(&self.rectifier).set_config(rectify);
        self.fusion.set_config(fusion);
    }
}

/// State shared with the consumer thread
struct Shared {
    config: EngineConfig,
    instances: Slab<Instance, MAX_INSTANCES>,
    queue: Mutex<Deque<Queued, QUEUE_CAPACITY>>,
    /// Popped but not yet processed; incremented under the queue lock
    in_flight: AtomicUsize,
    running: AtomicBool,
    overflows: AtomicU32,
}

impl Shared {
    fn instance(&self, handle: Handle) -> Result<&Instance> {
        self.instances.get(handle)
    }

    fn pop(&self) -> Option<Queued> {
        let mut queue = lock(&self.queue);
        let item = queue.pop_front();
        if item.is_some() {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        item
    }

    fn process(&self, item: Queued) {
        let result = self
            .instance(item.handle)
            .and_then(|instance| instance.run_job(item.job));
        if let Err(e) = result {
            debug!("instance {}: {}", item.handle, e);
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Nothing queued and nothing being processed
    fn idle(&self) -> bool {
        let queue = lock(&self.queue);
        queue.is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }

    fn consume(&self) {
        debug!("consumer started");
        let idle = Duration::from_micros(self.config.idle_sleep_us);
        while self.running.load(Ordering::Acquire) {
            match self.pop() {
                Some(item) => self.process(item),
                None => thread::sleep(idle),
            }
        }
        debug!("consumer stopped");
    }
}

/// Multi-instance fusion engine
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_calib::{Datum, Engine, EngineConfig, InstanceConfig, Pipeline, Status};
///
/// let mut engine = Engine::new(EngineConfig::default()).unwrap();
/// let imu = engine.add_instance(InstanceConfig::default(), Pipeline::FULL).unwrap();
///
/// let status = engine.submit(imu, Datum::accel(0, Vector3::new(0.0, 0.0, 1.0))).unwrap();
/// assert_eq!(status, Status::Queued);
///
/// engine.process_queued().unwrap();
/// let estimate = engine.get_estimate(imu).unwrap();
/// assert!(estimate.state.is_initialized());
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Create an engine with no instances
    pub fn new(config: EngineConfig) -> Result<Self> {
        if config.queue_depth > QUEUE_CAPACITY {
            return Err(Error::BadConfig("queue_depth exceeds QUEUE_CAPACITY"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                instances: Slab::new(),
                queue: Mutex::new(Deque::new()),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                overflows: AtomicU32::new(0),
            }),
            worker: None,
        })
    }

    /// Engine-wide config
    pub fn config(&self) -> EngineConfig {
        self.shared.config
    }

    /// Add an instance; only possible while the consumer is stopped
    pub fn add_instance(&mut self, config: InstanceConfig, pipeline: Pipeline) -> Result<Handle> {
        config.validate()?;
        let shared = Arc::get_mut(&mut self.shared).ok_or(Error::WorkerRunning)?;
        let handle = shared.instances.insert(Instance::new(config, pipeline))?;
        debug!("instance {} added with {:?}", handle, pipeline);
        Ok(handle)
    }

    /// Instances added so far
    pub fn instance_count(&self) -> usize {
        self.shared.instances.len()
    }

    /// Spawn the consumer thread
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::WorkerRunning);
        }
        if self.shared.config.queue_depth == 0 {
            return Err(Error::BadConfig("queue_depth 0 dispatches synchronously"));
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("fusion-consumer".into())
            .spawn(move || shared.consume());

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                warn!("consumer thread failed to start: {}", e);
                self.shared.running.store(false, Ordering::Release);
                Err(Error::WorkerRunning)
            }
        }
    }

    /// Signal the consumer and wait for it to exit
    ///
    /// The datum being processed completes; queued datums stay queued.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("consumer thread panicked");
            }
        }
    }

    /// True while the consumer thread is alive
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Submit one datum
    ///
    /// Returns [`Status::Queued`], or [`Status::Overflow`] when the oldest
    /// queued datum had to be evicted. A synchronous engine returns the
    /// pipeline's outcome directly.
    pub fn submit(&self, handle: Handle, datum: Datum) -> Result<Status> {
        self.dispatch(handle, Job::Single(datum))
    }

    /// Submit a synchronized triple; it occupies one queue slot
    pub fn submit_triple(&self, handle: Handle, triple: Triple) -> Result<Status> {
        self.dispatch(handle, Job::Triple(triple))
    }

    fn dispatch(&self, handle: Handle, job: Job) -> Result<Status> {
        let instance = self.shared.instance(handle)?;
        let depth = self.shared.config.queue_depth;
        if depth == 0 {
            return instance.run_job(job);
        }

        let evicted = {
            let mut queue = lock(&self.shared.queue);
            let evicted = if queue.len() >= depth {
                queue.pop_front()
            } else {
                None
            };
            // Depth never exceeds capacity, so this push has room
            let _ = queue.push_back(Queued { handle, job });
            evicted
        };

        match evicted {
            Some(dropped) => {
                let total = self.shared.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "queue full, evicted oldest datum for instance {} ({} total)",
                    dropped.handle, total
                );
                Ok(Status::Overflow)
            }
            None => Ok(Status::Queued),
        }
    }

    /// Run queued datums on the caller thread; fails while the consumer runs
    pub fn process_queued(&self) -> Result<usize> {
        if self.is_running() {
            return Err(Error::WorkerRunning);
        }
        let mut processed = 0;
        while let Some(item) = self.shared.pop() {
            self.shared.process(item);
            processed += 1;
        }
        Ok(processed)
    }

    /// Block until every queued datum has been processed
    ///
    /// Without a consumer the queue is processed on the caller thread.
    pub fn drain(&self) {
        if !self.is_running() {
            let _ = self.process_queued();
            return;
        }
        let idle = Duration::from_micros(self.shared.config.idle_sleep_us.max(1));
        while !self.shared.idle() {
            thread::sleep(idle);
        }
    }

    /// Datums waiting in the queue
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Datums evicted since the engine was created
    pub fn overflow_count(&self) -> u32 {
        self.shared.overflows.load(Ordering::Relaxed)
    }

    /// Orientation snapshot for an instance
    pub fn get_estimate(&self, handle: Handle) -> Result<Estimate> {
        Ok(self.shared.instance(handle)?.fusion.estimate())
    }

    /// Send the fusion core back through zeroing
    pub fn rezero(&self, handle: Handle) -> Result<()> {
        self.shared.instance(handle)?.fusion.reset();
        debug!("instance {} rezeroed", handle);
        Ok(())
    }

    /// Capture the current orientation as the instance's reference
    pub fn set_reference(&self, handle: Handle) -> Result<()> {
        self.shared.instance(handle)?.fusion.set_reference();
        Ok(())
    }

    /// Reset the instance's reference to identity
    pub fn clear_reference(&self, handle: Handle) -> Result<()> {
        self.shared.instance(handle)?.fusion.clear_reference();
        Ok(())
    }

    /// Begin calibrating an instance
    ///
    /// Snapshots the live rectifier and fusion configs and restarts the
    /// stability point counter with the mode's point count as its target.
    /// The stability config itself is left alone; the target reverts when
    /// the calibration is saved or aborted.
    pub fn start_calibration(&self, handle: Handle, mode: CalibrationMode) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        let rectify = lock(&instance.rectifier).config();
        let fusion = instance.fusion.config();
        {
            let mut detector = lock(&instance.detector);
            detector.set_target(Some(mode.points() as u32));
            detector.reset_points();
        }
        lock(&instance.calibrator).start(mode, rectify, fusion);
        Ok(())
    }

    /// Abandon an instance's calibration; live configs are untouched
    pub fn abort_calibration(&self, handle: Handle) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        lock(&instance.calibrator).abort();
        lock(&instance.detector).set_target(None);
        Ok(())
    }

    /// Commit a completed calibration into the live configs
    ///
    /// Waits for the instance's current pipeline pass; both configs switch
    /// before the next one.
    pub fn save_calibration(&self, handle: Handle) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        let (rectify, fusion) = lock(&instance.calibrator).save()?;
        instance.commit(rectify, fusion);
        lock(&instance.detector).set_target(None);
        info!("instance {} calibration saved", handle);
        Ok(())
    }

    /// Progress of the instance's calibration
    pub fn calibration_status(&self, handle: Handle) -> Result<CalibrationStatus> {
        let instance = self.shared.instance(handle)?;
        Ok(lock(&instance.calibrator).status())
    }

    /// Register (or clear) the calibration verifier
    pub fn set_verifier(&self, handle: Handle, verifier: Option<Verifier>) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        lock(&instance.calibrator).set_verifier(verifier);
        Ok(())
    }

    /// Register (or clear) the point completion callback
    ///
    /// The callback runs on the processing thread in the middle of the
    /// instance's pipeline pass; it must not call back into the engine for
    /// the same instance.
    pub fn set_point_callback(&self, handle: Handle, callback: Option<PointCallback>) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        let mut detector = lock(&instance.detector);
        match callback {
            Some(callback) => detector.set_callback(callback),
            None => detector.clear_callback(),
        }
        Ok(())
    }

    /// Replace one subsystem's config
    pub fn load_config(&self, handle: Handle, config: SubsystemConfig) -> Result<()> {
        let instance = self.shared.instance(handle)?;
        config.validate()?;
        match config {
            SubsystemConfig::Rectify(c) => lock(&instance.rectifier).set_config(c),
            SubsystemConfig::Stability(c) => lock(&instance.detector).set_config(c),
            SubsystemConfig::Stats(c) => lock(&instance.stats).set_config(c),
            SubsystemConfig::Fusion(c) => instance.fusion.set_config(c),
            SubsystemConfig::Calibration(c) => lock(&instance.calibrator).set_config(c),
        }
        debug!("instance {} loaded {:?} config", handle, config.subsystem());
        Ok(())
    }

    /// Copy one subsystem's live config out
    pub fn subsystem_config(&self, handle: Handle, subsystem: Subsystem) -> Result<SubsystemConfig> {
        let instance = self.shared.instance(handle)?;
        Ok(match subsystem {
            Subsystem::Rectify => SubsystemConfig::Rectify(lock(&instance.rectifier).config()),
            Subsystem::Stability => SubsystemConfig::Stability(lock(&instance.detector).config()),
            Subsystem::Stats => SubsystemConfig::Stats(lock(&instance.stats).config()),
            Subsystem::Fusion => SubsystemConfig::Fusion(instance.fusion.config()),
            Subsystem::Calibration => {
                SubsystemConfig::Calibration(lock(&instance.calibrator).config())
            }
        })
    }

    /// Copy of the stored stability points, oldest first
    pub fn points(&self, handle: Handle) -> Result<Points> {
        let instance = self.shared.instance(handle)?;
        let detector = lock(&instance.detector);
        Ok(detector.points().copied().collect())
    }

    /// Points captured toward the current target
    pub fn captured_points(&self, handle: Handle) -> Result<u32> {
        let instance = self.shared.instance(handle)?;
        Ok(lock(&instance.detector).captured())
    }

    /// Current stability state
    pub fn stability_state(&self, handle: Handle) -> Result<StabilityState> {
        let instance = self.shared.instance(handle)?;
        Ok(lock(&instance.detector).state())
    }

    /// Snapshot of the instance's statistics
    pub fn stats(&self, handle: Handle) -> Result<StatsSnapshot> {
        let instance = self.shared.instance(handle)?;
        Ok(lock(&instance.stats).snapshot())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.shared.config)
            .field("instances", &self.shared.instances.len())
            .field("running", &self.is_running())
            .finish()
    }
}
