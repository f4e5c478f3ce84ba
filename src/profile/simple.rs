//! Linear cost model profile.
//!
//! cost = baseline + work_units * cost_per_unit. The baseline and per-unit
//! cost are learned from measurements with an exponential moving average.
//! Suitable for batch-style tasks where cost scales linearly and
//! measurement data is sparse.

use serde_json::{Map, Value};

use super::{PendingSample, ProfileCore, TaskProfile};
use crate::error::GraphResult;

const SMOOTHING_ALPHA: f64 = 0.1;

pub struct SimpleTaskProfile {
    core: ProfileCore,
    cost_at_baseline_ns: u64,
    cost_per_unit_ns: u64,
}

impl Default for SimpleTaskProfile {
    fn default() -> Self {
        SimpleTaskProfile {
            core: ProfileCore::default(),
            cost_at_baseline_ns: 0,
            cost_per_unit_ns: 0,
        }
    }
}

impl SimpleTaskProfile {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> SimpleTaskProfile {
        SimpleTaskProfile {
            core: ProfileCore::named(name, category),
            cost_at_baseline_ns: 0,
            cost_per_unit_ns: 0,
        }
    }

    pub fn baseline_cost_ns(&self) -> u64 {
        self.cost_at_baseline_ns
    }

    pub fn cost_per_unit_ns(&self) -> u64 {
        self.cost_per_unit_ns
    }

    /// Pre-calibrate the baseline without measurements.
    pub fn set_baseline_cost_ns(&mut self, cost: u64) {
        self.cost_at_baseline_ns = cost;
        self.core.is_calibrated = true;
    }

    pub fn set_cost_per_unit_ns(&mut self, cost_per_unit: u64) {
        self.cost_per_unit_ns = cost_per_unit;
    }
}

impl TaskProfile for SimpleTaskProfile {
    fn core(&self) -> &ProfileCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProfileCore {
        &mut self.core
    }

    fn type_name(&self) -> &'static str {
        "SimpleTaskProfile"
    }

    fn estimated_cost_ns(&self) -> u64 {
        if !self.core.is_calibrated {
            return 0;
        }
        let estimate = self.cost_at_baseline_ns as i64
            + self.core.work_units as i64 * self.cost_per_unit_ns as i64;
        estimate.max(0) as u64
    }

    fn consume_sample(&mut self, sample: PendingSample) {
        let was_calibrated = self.core.is_calibrated;
        self.core.apply_sample_stats(sample.elapsed_ns);

        if !was_calibrated {
            // First measurement becomes the baseline.
            self.cost_at_baseline_ns = sample.elapsed_ns;
        } else if sample.work_units == 0 {
            self.cost_at_baseline_ns = ema(self.cost_at_baseline_ns, sample.elapsed_ns);
        } else {
            // Away from baseline: the delta divided by the level gives an
            // observation of the per-unit cost.
            let delta = sample.elapsed_ns as i64 - self.cost_at_baseline_ns as i64;
            let observed = delta / sample.work_units as i64;
            if observed > 0 {
                self.cost_per_unit_ns = ema(self.cost_per_unit_ns, observed as u64);
            }
        }
    }

    fn save_state(&self) -> Value {
        let mut state = self.core.save_common(self.type_name());
        let object = state.as_object_mut().expect("save_common returns an object");
        object.insert("costAtBaselineNs".into(), self.cost_at_baseline_ns.into());
        object.insert("costPerUnitNs".into(), self.cost_per_unit_ns.into());
        state
    }

    fn load_state(&mut self, state: &Map<String, Value>) -> GraphResult<()> {
        self.core.load_common(state);
        if let Some(v) = state.get("costAtBaselineNs").and_then(Value::as_u64) {
            self.cost_at_baseline_ns = v;
        }
        if let Some(v) = state.get("costPerUnitNs").and_then(Value::as_u64) {
            self.cost_per_unit_ns = v;
        }
        Ok(())
    }

    fn state_description(&self) -> String {
        let est_ms = self.estimated_cost_ns() as f64 / 1_000_000.0;
        let calibration = if self.core.is_calibrated {
            format!("calibrated, {} samples", self.core.sample_count)
        } else {
            String::from("uncalibrated")
        };
        format!(
            "{}: workUnits={:+}, est={est_ms:.2}ms ({calibration})",
            self.core.name, self.core.work_units
        )
    }

    fn reset_calibration(&mut self) {
        self.core.reset();
        self.cost_at_baseline_ns = 0;
        self.cost_per_unit_ns = 0;
    }
}

fn ema(current: u64, observed: u64) -> u64 {
    (current as f64 * (1.0 - SMOOTHING_ALPHA) + observed as f64 * SMOOTHING_ALPHA) as u64
}

//--------------------------------------------------------------------------------------------------
