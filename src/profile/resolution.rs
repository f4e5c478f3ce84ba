//! Resolution-table cost model profile.
//!
//! Maps work units to a resolution through an 11-entry lookup table
//! (work_units + 5 indexes it). Cost per level is measured directly where
//! samples exist; unmeasured levels extrapolate quadratically from the
//! baseline, since cost tracks the pixel count.

use serde_json::{Map, Value};

use super::{PendingSample, ProfileCore, TaskProfile, WorkUnitType};
use crate::error::GraphResult;

pub const NUM_LEVELS: usize = 11;

const DEFAULT_RESOLUTIONS: [u32; NUM_LEVELS] =
    [128, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 4096];

pub struct ResolutionTaskProfile {
    core: ProfileCore,
    resolutions: [u32; NUM_LEVELS],
    current_resolution: u32,
    baseline_resolution: u32,
    baseline_cost_ns: u64,
    measured_costs_per_level: [u64; NUM_LEVELS],
}

impl Default for ResolutionTaskProfile {
    fn default() -> Self {
        let mut core = ProfileCore::default();
        core.work_unit_type = WorkUnitType::Resolution;
        let mut profile = ResolutionTaskProfile {
            core,
            resolutions: DEFAULT_RESOLUTIONS,
            current_resolution: 1024,
            baseline_resolution: 1024,
            baseline_cost_ns: 0,
            measured_costs_per_level: [0; NUM_LEVELS],
        };
        profile.update_current_resolution();
        profile
    }
}

impl ResolutionTaskProfile {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        resolutions: [u32; NUM_LEVELS],
    ) -> ResolutionTaskProfile {
        let mut core = ProfileCore::named(name, category);
        core.work_unit_type = WorkUnitType::Resolution;
        let mut profile = ResolutionTaskProfile {
            core,
            resolutions,
            current_resolution: resolutions[NUM_LEVELS / 2],
            baseline_resolution: resolutions[NUM_LEVELS / 2],
            baseline_cost_ns: 0,
            measured_costs_per_level: [0; NUM_LEVELS],
        };
        profile.update_current_resolution();
        profile
    }

    pub fn with_default_table(
        name: impl Into<String>,
        category: impl Into<String>,
    ) -> ResolutionTaskProfile {
        ResolutionTaskProfile::new(name, category, DEFAULT_RESOLUTIONS)
    }

    fn level_index(&self, units: i32) -> usize {
        let clamped = units.clamp(self.core.min_work_units, self.core.max_work_units);
        (clamped + 5) as usize
    }

    fn update_current_resolution(&mut self) {
        self.current_resolution = self.resolutions[self.level_index(self.core.work_units)];
    }

    pub fn resolution(&self) -> u32 {
        self.current_resolution
    }

    pub fn resolution_at_level(&self, units: i32) -> u32 {
        self.resolutions[self.level_index(units)]
    }

    pub fn set_resolution_table(&mut self, resolutions: [u32; NUM_LEVELS]) {
        self.resolutions = resolutions;
        self.update_current_resolution();
    }

    /// Measured cost at a level, zero when the level has no samples yet.
    pub fn measured_cost_at_level(&self, units: i32) -> u64 {
        self.measured_costs_per_level[self.level_index(units)]
    }

    pub fn calibrated_level_count(&self) -> usize {
        self.measured_costs_per_level
            .iter()
            .filter(|&&cost| cost > 0)
            .count()
    }
}

impl TaskProfile for ResolutionTaskProfile {
    fn core(&self) -> &ProfileCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProfileCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        "ResolutionTaskProfile"
    }

    fn on_work_units_changed(&mut self, _old_units: i32, _new_units: i32) {
        self.update_current_resolution();
    }

    fn estimated_cost_ns(&self) -> u64 {
        let index = self.level_index(self.core.work_units);
        if self.measured_costs_per_level[index] > 0 {
            return self.measured_costs_per_level[index];
        }
        if self.baseline_cost_ns == 0 {
            return 0;
        }
        // Quadratic extrapolation from the baseline level.
        let scale = (self.current_resolution as f64 * self.current_resolution as f64)
            / (self.baseline_resolution as f64 * self.baseline_resolution as f64);
        (self.baseline_cost_ns as f64 * scale) as u64
    }

    fn consume_sample(&mut self, sample: PendingSample) {
        self.core.apply_sample_stats(sample.elapsed_ns);

        let index = self.level_index(sample.work_units);
        if self.measured_costs_per_level[index] == 0 {
            self.measured_costs_per_level[index] = sample.elapsed_ns;
        } else {
            self.measured_costs_per_level[index] = (self.measured_costs_per_level[index] as f64
                * 0.9
                + sample.elapsed_ns as f64 * 0.1) as u64;
        }

        if sample.work_units == 0 {
            let level_resolution = self.resolutions[index];
            if self.baseline_cost_ns == 0 {
                self.baseline_cost_ns = sample.elapsed_ns;
                self.baseline_resolution = level_resolution;
            } else {
                self.baseline_cost_ns =
                    (self.baseline_cost_ns as f64 * 0.9 + sample.elapsed_ns as f64 * 0.1) as u64;
            }
        }
    }

    fn save_state(&self) -> Value {
        let mut state = self.core.save_common(self.type_name());
        let object = state.as_object_mut().expect("save_common returns an object");
        object.insert("currentResolution".into(), self.current_resolution.into());
        object.insert("baselineResolution".into(), self.baseline_resolution.into());
        object.insert("baselineCostNs".into(), self.baseline_cost_ns.into());
        object.insert(
            "resolutions".into(),
            Value::Array(self.resolutions.iter().map(|&r| r.into()).collect()),
        );
        object.insert(
            "measuredCostsPerLevel".into(),
            Value::Array(
                self.measured_costs_per_level
                    .iter()
                    .map(|&c| c.into())
                    .collect(),
            ),
        );
        state
    }

    fn load_state(&mut self, state: &Map<String, Value>) -> GraphResult<()> {
        self.core.load_common(state);
        if let Some(v) = state.get("currentResolution").and_then(Value::as_u64) {
            self.current_resolution = v as u32;
        }
        if let Some(v) = state.get("baselineResolution").and_then(Value::as_u64) {
            self.baseline_resolution = v as u32;
        }
        if let Some(v) = state.get("baselineCostNs").and_then(Value::as_u64) {
            self.baseline_cost_ns = v;
        }
        if let Some(values) = state.get("resolutions").and_then(Value::as_array) {
            for (i, v) in values.iter().take(NUM_LEVELS).enumerate() {
                if let Some(r) = v.as_u64() {
                    self.resolutions[i] = r as u32;
                }
            }
        }
        if let Some(values) = state.get("measuredCostsPerLevel").and_then(Value::as_array) {
            for (i, v) in values.iter().take(NUM_LEVELS).enumerate() {
                if let Some(c) = v.as_u64() {
                    self.measured_costs_per_level[i] = c;
                }
            }
        }
        self.update_current_resolution();
        Ok(())
    }

    fn state_description(&self) -> String {
        let est_ms = self.estimated_cost_ns() as f64 / 1_000_000.0;
        format!(
            "{}: {}x{} (workUnits={:+}, est={est_ms:.2}ms)",
            self.core.name, self.current_resolution, self.current_resolution, self.core.work_units
        )
    }

    fn reset_calibration(&mut self) {
        self.core.reset();
        self.measured_costs_per_level = [0; NUM_LEVELS];
        self.baseline_cost_ns = 0;
        self.baseline_resolution = self.resolutions[NUM_LEVELS / 2];
        self.update_current_resolution();
    }
}

//--------------------------------------------------------------------------------------------------
