//! Adaptive task profiles.
//!
//! A profile models the cost of one schedulable piece of work and exposes a
//! pressure valve: `increase`/`decrease` move an integer work-unit setting
//! inside `[min, max]`, and the profile translates the setting into an
//! actual workload change (batch size, resolution level, iteration cap).
//!
//! Measurements are collected concurrently into a bounded pending buffer and
//! folded into the cost model by `process_samples`, which the orchestrator
//! calls at end of frame.

mod capacity;
mod registry;
mod resolution;
mod simple;

pub use self::capacity::{CapacityAction, CapacityTracker};
pub use self::registry::{ProfileFactory, TaskProfileRegistry, PROFILE_STATE_VERSION};
pub use self::resolution::ResolutionTaskProfile;
pub use self::simple::SimpleTaskProfile;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use downcast_rs::{impl_downcast, Downcast};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};

use crate::error::{GraphError, GraphResult};

/// Shared handle to a profile. Reads (queries, measurement recording) take
/// the read lock; model updates and valve changes take the write lock.
pub type SharedProfile = Arc<RwLock<dyn TaskProfile>>;

/// How a profile interprets its work-unit setting. Serialized as an integer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(i32)]
pub enum WorkUnitType {
    BatchSize = 0,
    Resolution = 1,
    ThreadCount = 2,
    IterationLimit = 3,
    LodLevel = 4,
    #[default]
    Custom = 5,
}

impl WorkUnitType {
    pub fn from_i64(value: i64) -> WorkUnitType {
        match value {
            0 => WorkUnitType::BatchSize,
            1 => WorkUnitType::Resolution,
            2 => WorkUnitType::ThreadCount,
            3 => WorkUnitType::IterationLimit,
            4 => WorkUnitType::LodLevel,
            _ => WorkUnitType::Custom,
        }
    }
}

/// One raw measurement waiting to be folded into the cost model. The
/// work-unit level is captured at record time so deferred processing
/// attributes the sample to the right level.
#[derive(Copy, Clone, Debug)]
pub struct PendingSample {
    pub work_units: i32,
    pub elapsed_ns: u64,
}

/// Bounded ring of pending samples; at capacity the oldest is dropped.
pub(crate) const MAX_PENDING_SAMPLES: usize = 1024;

/// Common profile state. Concrete profiles embed one and hand out access
/// through `core`/`core_mut`.
pub struct ProfileCore {
    pub(crate) profile_id: u64,
    pub(crate) name: String,
    pub(crate) category: String,
    pub(crate) work_units: i32,
    pub(crate) min_work_units: i32,
    pub(crate) max_work_units: i32,
    pub(crate) priority: u8,
    pub(crate) work_unit_type: WorkUnitType,
    pub(crate) sample_count: u32,
    pub(crate) last_measured_cost_ns: u64,
    pub(crate) peak_measured_cost_ns: u64,
    pub(crate) is_calibrated: bool,
    pending: Mutex<VecDeque<PendingSample>>,
}

impl Default for ProfileCore {
    fn default() -> Self {
        ProfileCore {
            profile_id: 0,
            name: String::new(),
            category: String::new(),
            work_units: 0,
            min_work_units: -5,
            max_work_units: 5,
            priority: 128,
            work_unit_type: WorkUnitType::Custom,
            sample_count: 0,
            last_measured_cost_ns: 0,
            peak_measured_cost_ns: 0,
            is_calibrated: false,
            pending: Mutex::new(VecDeque::new()),
        }
    }
}

impl ProfileCore {
    pub fn named(name: impl Into<String>, category: impl Into<String>) -> ProfileCore {
        ProfileCore {
            name: name.into(),
            category: category.into(),
            ..ProfileCore::default()
        }
    }

    /// Thread-safe: append a sample to the bounded pending ring.
    pub fn push_sample(&self, elapsed_ns: u64) {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_SAMPLES {
            pending.pop_front();
        }
        pending.push_back(PendingSample {
            work_units: self.work_units,
            elapsed_ns,
        });
    }

    pub fn take_pending(&self) -> Vec<PendingSample> {
        self.pending.lock().drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fold one sample into the common statistics.
    pub fn apply_sample_stats(&mut self, elapsed_ns: u64) {
        self.last_measured_cost_ns = elapsed_ns;
        self.peak_measured_cost_ns = self.peak_measured_cost_ns.max(elapsed_ns);
        self.sample_count += 1;
        self.is_calibrated = true;
    }

    pub fn reset(&mut self) {
        self.work_units = 0;
        self.sample_count = 0;
        self.last_measured_cost_ns = 0;
        self.peak_measured_cost_ns = 0;
        self.is_calibrated = false;
        self.pending.lock().clear();
    }

    pub fn save_common(&self, type_name: &str) -> Value {
        json!({
            "typeName": type_name,
            "name": self.name,
            "category": self.category,
            "workUnits": self.work_units,
            "minWorkUnits": self.min_work_units,
            "maxWorkUnits": self.max_work_units,
            "priority": self.priority,
            "workUnitType": self.work_unit_type as i32,
            "sampleCount": self.sample_count,
            "lastMeasuredCostNs": self.last_measured_cost_ns,
            "peakMeasuredCostNs": self.peak_measured_cost_ns,
            "isCalibrated": self.is_calibrated,
        })
    }

    pub fn load_common(&mut self, state: &Map<String, Value>) {
        if let Some(v) = state.get("name").and_then(Value::as_str) {
            self.name = v.to_string();
        }
        if let Some(v) = state.get("category").and_then(Value::as_str) {
            self.category = v.to_string();
        }
        if let Some(v) = state.get("workUnits").and_then(Value::as_i64) {
            self.work_units = v as i32;
        }
        if let Some(v) = state.get("minWorkUnits").and_then(Value::as_i64) {
            self.min_work_units = v as i32;
        }
        if let Some(v) = state.get("maxWorkUnits").and_then(Value::as_i64) {
            self.max_work_units = v as i32;
        }
        if let Some(v) = state.get("priority").and_then(Value::as_u64) {
            self.priority = v as u8;
        }
        if let Some(v) = state.get("workUnitType").and_then(Value::as_i64) {
            self.work_unit_type = WorkUnitType::from_i64(v);
        }
        if let Some(v) = state.get("sampleCount").and_then(Value::as_u64) {
            self.sample_count = v as u32;
        }
        if let Some(v) = state.get("lastMeasuredCostNs").and_then(Value::as_u64) {
            self.last_measured_cost_ns = v;
        }
        if let Some(v) = state.get("peakMeasuredCostNs").and_then(Value::as_u64) {
            self.peak_measured_cost_ns = v;
        }
        if let Some(v) = state.get("isCalibrated").and_then(Value::as_bool) {
            self.is_calibrated = v;
        }
        self.work_units = self.work_units.clamp(self.min_work_units, self.max_work_units);
    }
}

//--------------------------------------------------------------------------------------------------

/// Task profile contract. Concrete profiles implement the cost model and
/// react to work-unit changes; everything else is provided on top of
/// `ProfileCore`.
pub trait TaskProfile: Downcast + Send + Sync {
    fn core(&self) -> &ProfileCore;
    fn core_mut(&mut self) -> &mut ProfileCore;

    /// Type identifier used by the factory registry for deserialization.
    fn type_name(&self) -> &'static str;

    /// Human-readable state line for logging.
    fn state_description(&self) -> String;

    /// Cost estimate at the current work-unit setting.
    fn estimated_cost_ns(&self) -> u64;

    /// React to a pressure-valve change (swap a resolution, resize a
    /// batch). Only invoked when the value actually changed.
    fn on_work_units_changed(&mut self, _old_units: i32, _new_units: i32) {}

    /// Fold one measurement into the cost model. The default updates the
    /// common statistics only.
    fn consume_sample(&mut self, sample: PendingSample) {
        self.core_mut().apply_sample_stats(sample.elapsed_ns);
    }

    /// Serialize to a JSON object. Overrides extend the common fields.
    fn save_state(&self) -> Value {
        self.core().save_common(self.type_name())
    }

    /// Restore from a JSON object produced by `save_state`.
    fn load_state(&mut self, state: &Map<String, Value>) -> GraphResult<()> {
        self.core_mut().load_common(state);
        Ok(())
    }

    fn reset_calibration(&mut self) {
        self.core_mut().reset();
    }

    //---------------------------------------------------------------------
    // Provided: identity

    fn profile_id(&self) -> u64 {
        self.core().profile_id
    }

    fn name(&self) -> &str {
        &self.core().name
    }

    fn category(&self) -> &str {
        &self.core().category
    }

    fn priority(&self) -> u8 {
        self.core().priority
    }

    fn set_priority(&mut self, priority: u8) {
        self.core_mut().priority = priority;
    }

    fn work_unit_type(&self) -> WorkUnitType {
        self.core().work_unit_type
    }

    //---------------------------------------------------------------------
    // Provided: pressure valve

    fn work_units(&self) -> i32 {
        self.core().work_units
    }

    fn min_work_units(&self) -> i32 {
        self.core().min_work_units
    }

    fn max_work_units(&self) -> i32 {
        self.core().max_work_units
    }

    fn set_bounds(&mut self, min: i32, max: i32) {
        let core = self.core_mut();
        core.min_work_units = min;
        core.max_work_units = max;
        core.work_units = core.work_units.clamp(min, max);
    }

    fn can_increase(&self) -> bool {
        self.core().work_units < self.core().max_work_units
    }

    fn can_decrease(&self) -> bool {
        self.core().work_units > self.core().min_work_units
    }

    /// Raise the setting by one. Returns false at the upper bound.
    fn increase(&mut self) -> bool {
        if !self.can_increase() {
            return false;
        }
        let old = self.core().work_units;
        self.core_mut().work_units = old + 1;
        self.on_work_units_changed(old, old + 1);
        true
    }

    /// Lower the setting by one. Returns false at the lower bound.
    fn decrease(&mut self) -> bool {
        if !self.can_decrease() {
            return false;
        }
        let old = self.core().work_units;
        self.core_mut().work_units = old - 1;
        self.on_work_units_changed(old, old - 1);
        true
    }

    /// Jump to a specific setting, clamped to the bounds. The change hook
    /// fires only when the value actually moves.
    fn set_work_units(&mut self, units: i32) {
        let core = self.core();
        let clamped = units.clamp(core.min_work_units, core.max_work_units);
        let old = core.work_units;
        if clamped != old {
            self.core_mut().work_units = clamped;
            self.on_work_units_changed(old, clamped);
        }
    }

    /// Normalized pressure: -1.0 at min through 0.0 at baseline to +1.0 at
    /// max.
    fn pressure(&self) -> f32 {
        let core = self.core();
        if core.work_units == 0 {
            0.0
        } else if core.work_units > 0 && core.max_work_units > 0 {
            core.work_units as f32 / core.max_work_units as f32
        } else if core.work_units < 0 && core.min_work_units < 0 {
            core.work_units as f32 / -(core.min_work_units as f32)
        } else {
            0.0
        }
    }

    //---------------------------------------------------------------------
    // Provided: measurement

    /// Thread-safe: append a measurement to the pending ring. Folded into
    /// the model by `process_samples`.
    fn record_measurement(&self, elapsed_ns: u64) {
        self.core().push_sample(elapsed_ns);
    }

    /// Drain pending samples into the cost model. Called at end of frame by
    /// the orchestrator, under no external lock.
    fn process_samples(&mut self) {
        let samples = self.core().take_pending();
        for sample in samples {
            self.consume_sample(sample);
        }
    }

    fn pending_sample_count(&self) -> usize {
        self.core().pending_count()
    }

    fn has_pending_samples(&self) -> bool {
        self.pending_sample_count() > 0
    }

    //---------------------------------------------------------------------
    // Provided: statistics

    fn sample_count(&self) -> u32 {
        self.core().sample_count
    }

    fn last_measured_cost_ns(&self) -> u64 {
        self.core().last_measured_cost_ns
    }

    fn peak_measured_cost_ns(&self) -> u64 {
        self.core().peak_measured_cost_ns
    }

    fn is_calibrated(&self) -> bool {
        self.core().is_calibrated
    }

    /// Calibration with enough samples behind it to trust.
    fn has_reliable_calibration(&self) -> bool {
        self.core().is_calibrated && self.core().sample_count >= 10
    }
}

impl_downcast!(TaskProfile);

//--------------------------------------------------------------------------------------------------

/// Owned scope guard measuring one elapsed interval. Feeds one sample to
/// its profile on drop; `finalize` substitutes an externally-measured value
/// (a GPU timestamp) and disables the drop-time write so the interval is
/// not double-counted.
pub struct Sampler {
    profile: Option<SharedProfile>,
    start: Instant,
}

impl Sampler {
    pub fn new(profile: SharedProfile) -> Sampler {
        Sampler {
            profile: Some(profile),
            start: Instant::now(),
        }
    }

    /// Elapsed time so far without ending the measurement.
    pub fn elapsed_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Record an externally-measured interval instead of the CPU-side one.
    pub fn finalize(mut self, measured_ns: u64) {
        if let Some(profile) = self.profile.take() {
            profile.read().record_measurement(measured_ns);
        }
    }

    /// Discard the measurement entirely.
    pub fn cancel(mut self) {
        self.profile = None;
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(profile) = self.profile.take() {
            profile.read().record_measurement(self.elapsed_ns());
        }
    }
}

/// Errors on malformed persistence payloads share one constructor.
pub(crate) fn state_object(state: &Value) -> GraphResult<&Map<String, Value>> {
    state
        .as_object()
        .ok_or_else(|| GraphError::ProfileStateMalformed("profile entry is not an object".into()))
}

//--------------------------------------------------------------------------------------------------
