//! Capacity tracker.
//!
//! Compares the summed cost estimates of a category's profiles against a
//! frame budget and drives the registry's pressure valves: over budget
//! throttles the least protected profile, comfortably under budget for a
//! streak of frames gives headroom back to the most protected one.

use super::TaskProfileRegistry;

/// What the tracker did this frame.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum CapacityAction {
    #[default]
    None,
    Decreased {
        profile: String,
    },
    Increased {
        profile: String,
    },
}

pub struct CapacityTracker {
    category: Option<String>,
    budget_ns: u64,
    /// Fraction of the budget below which a frame counts as "comfortably
    /// under".
    headroom_ratio: f64,
    /// Consecutive under-budget frames required before increasing.
    frames_before_increase: u32,
    under_budget_streak: u32,
}

impl CapacityTracker {
    /// Budget for one category. `None` scopes the tracker to every profile.
    pub fn new(category: Option<&str>, budget_ns: u64) -> CapacityTracker {
        CapacityTracker {
            category: category.map(str::to_string),
            budget_ns,
            headroom_ratio: 0.85,
            frames_before_increase: 120,
            under_budget_streak: 0,
        }
    }

    pub fn with_headroom_ratio(mut self, ratio: f64) -> CapacityTracker {
        self.headroom_ratio = ratio;
        self
    }

    pub fn with_frames_before_increase(mut self, frames: u32) -> CapacityTracker {
        self.frames_before_increase = frames;
        self
    }

    pub fn budget_ns(&self) -> u64 {
        self.budget_ns
    }

    pub fn set_budget_ns(&mut self, budget_ns: u64) {
        self.budget_ns = budget_ns;
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Current summed estimate of the tracked scope.
    pub fn estimated_cost_ns(&self, registry: &TaskProfileRegistry) -> u64 {
        registry.estimated_cost_ns(self.category.as_deref())
    }

    /// Run once per frame after `process_all_samples`. Applies at most one
    /// valve change per call.
    pub fn update(&mut self, registry: &mut TaskProfileRegistry) -> CapacityAction {
        let cost = self.estimated_cost_ns(registry);
        let category = self.category.as_deref();

        if cost > self.budget_ns {
            self.under_budget_streak = 0;
            if let Some((profile, old, new)) = registry.decrease_lowest_priority(category) {
                log::debug!(
                    "capacity: {} over budget ({cost}ns > {}ns), {profile} {old} -> {new}",
                    category.unwrap_or("all"),
                    self.budget_ns
                );
                return CapacityAction::Decreased { profile };
            }
            return CapacityAction::None;
        }

        if (cost as f64) < self.budget_ns as f64 * self.headroom_ratio {
            self.under_budget_streak += 1;
            if self.under_budget_streak >= self.frames_before_increase {
                self.under_budget_streak = 0;
                if let Some((profile, _, _)) = registry.increase_highest_priority(category) {
                    return CapacityAction::Increased { profile };
                }
            }
        } else {
            self.under_budget_streak = 0;
        }
        CapacityAction::None
    }
}

//--------------------------------------------------------------------------------------------------
