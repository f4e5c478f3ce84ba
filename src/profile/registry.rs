//! Task-profile registry.
//!
//! Central owner of every profile: typed get-or-create, bulk operations by
//! category, pressure-valve walks for the capacity tracker, and JSON
//! persistence with a factory registry for deserialization.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::{state_object, SharedProfile, TaskProfile};
use crate::error::{GraphError, GraphResult};

pub const PROFILE_STATE_VERSION: i64 = 1;

pub type ProfileFactory = Box<dyn Fn() -> SharedProfile + Send + Sync>;

/// Callback fired when a pressure valve moves a profile's work units.
pub type WorkUnitChangeCallback = Box<dyn Fn(&str, i32, i32) + Send + Sync>;

#[derive(Default)]
pub struct TaskProfileRegistry {
    /// Insertion order preserved for deterministic walks.
    profiles: Vec<SharedProfile>,
    by_name: FxHashMap<String, usize>,
    factories: FxHashMap<String, ProfileFactory>,
    change_callbacks: Vec<WorkUnitChangeCallback>,
    next_profile_id: u64,
}

impl TaskProfileRegistry {
    pub fn new() -> TaskProfileRegistry {
        TaskProfileRegistry {
            next_profile_id: 1,
            ..TaskProfileRegistry::default()
        }
    }

    //---------------------------------------------------------------------
    // Registration

    /// Fetch the profile registered under `name`, or create it with
    /// `P::default()`. Fails if the name is taken by a different profile
    /// type.
    pub fn get_or_create<P>(
        &mut self,
        name: &str,
        category: &str,
    ) -> GraphResult<SharedProfile>
    where
        P: TaskProfile + Default,
    {
        if let Some(&index) = self.by_name.get(name) {
            let existing = &self.profiles[index];
            if !existing.read().is::<P>() {
                return Err(GraphError::ProfileTypeConflict {
                    name: name.to_string(),
                });
            }
            return Ok(Arc::clone(existing));
        }
        let mut profile = P::default();
        profile.core_mut().name = name.to_string();
        profile.core_mut().category = category.to_string();
        Ok(self.insert(profile))
    }

    /// Insert a concretely constructed profile (a resolution profile with a
    /// custom table, for example). The registry assigns the profile id.
    pub fn insert<P: TaskProfile>(&mut self, profile: P) -> SharedProfile {
        let shared: SharedProfile = Arc::new(RwLock::new(profile));
        self.insert_shared(shared)
    }

    fn insert_shared(&mut self, shared: SharedProfile) -> SharedProfile {
        let name = {
            let mut guard = shared.write();
            guard.core_mut().profile_id = self.next_profile_id;
            self.next_profile_id += 1;
            guard.name().to_string()
        };
        self.by_name.insert(name, self.profiles.len());
        self.profiles.push(Arc::clone(&shared));
        shared
    }

    pub fn get(&self, name: &str) -> Option<SharedProfile> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.profiles[index]))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> &[SharedProfile] {
        &self.profiles
    }

    pub fn profiles_in_category(&self, category: &str) -> Vec<SharedProfile> {
        self.profiles
            .iter()
            .filter(|p| p.read().category() == category)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
        self.by_name.clear();
        self.next_profile_id = 1;
    }

    //---------------------------------------------------------------------
    // Factories

    /// Register a deserialization factory. Must happen before
    /// `load_from_json` sees the type name.
    pub fn register_factory(
        &mut self,
        type_name: impl Into<String>,
        factory: impl Fn() -> SharedProfile + Send + Sync + 'static,
    ) {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    /// The built-in profile types.
    pub fn register_builtin_factories(&mut self) {
        self.register_factory("SimpleTaskProfile", || {
            Arc::new(RwLock::new(super::SimpleTaskProfile::default()))
        });
        self.register_factory("ResolutionTaskProfile", || {
            Arc::new(RwLock::new(super::ResolutionTaskProfile::default()))
        });
    }

    //---------------------------------------------------------------------
    // Sample processing and cost queries

    /// Drain pending samples on every profile. Called once per frame by the
    /// orchestrator.
    pub fn process_all_samples(&self) {
        for profile in &self.profiles {
            profile.write().process_samples();
        }
    }

    /// Summed cost estimate over a category, or over everything when
    /// `category` is `None`.
    pub fn estimated_cost_ns(&self, category: Option<&str>) -> u64 {
        self.profiles
            .iter()
            .filter(|p| category.map_or(true, |c| p.read().category() == c))
            .map(|p| p.read().estimated_cost_ns())
            .sum()
    }

    //---------------------------------------------------------------------
    // Pressure valves

    /// Throttle: walk profiles from least protected (highest priority
    /// value) to most protected and decrease the first one that can move.
    /// Returns the change applied.
    pub fn decrease_lowest_priority(
        &mut self,
        category: Option<&str>,
    ) -> Option<(String, i32, i32)> {
        let mut candidates = self.candidates(category);
        candidates.sort_by_key(|&(_, priority)| std::cmp::Reverse(priority));
        self.apply_valve(candidates, |profile| profile.decrease())
    }

    /// Give headroom back: walk profiles from most protected to least and
    /// increase the first one that can move.
    pub fn increase_highest_priority(
        &mut self,
        category: Option<&str>,
    ) -> Option<(String, i32, i32)> {
        let mut candidates = self.candidates(category);
        candidates.sort_by_key(|&(_, priority)| priority);
        self.apply_valve(candidates, |profile| profile.increase())
    }

    fn candidates(&self, category: Option<&str>) -> Vec<(usize, u8)> {
        self.profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| category.map_or(true, |c| p.read().category() == c))
            .map(|(i, p)| (i, p.read().priority()))
            .collect()
    }

    fn apply_valve(
        &mut self,
        candidates: Vec<(usize, u8)>,
        valve: impl Fn(&mut dyn TaskProfile) -> bool,
    ) -> Option<(String, i32, i32)> {
        for (index, _) in candidates {
            let profile = &self.profiles[index];
            let mut guard = profile.write();
            let old = guard.work_units();
            if valve(&mut *guard) {
                let new = guard.work_units();
                let name = guard.name().to_string();
                drop(guard);
                for callback in &self.change_callbacks {
                    callback(&name, old, new);
                }
                return Some((name, old, new));
            }
        }
        None
    }

    /// Notification for nodes that have to react to valve changes.
    pub fn on_work_units_changed(
        &mut self,
        callback: impl Fn(&str, i32, i32) + Send + Sync + 'static,
    ) {
        self.change_callbacks.push(Box::new(callback));
    }

    pub fn reset_all_calibration(&mut self) {
        for profile in &self.profiles {
            profile.write().reset_calibration();
        }
    }

    //---------------------------------------------------------------------
    // Persistence

    pub fn save_to_json(&self) -> Value {
        let profiles: Vec<Value> = self
            .profiles
            .iter()
            .map(|p| p.read().save_state())
            .collect();
        json!({
            "version": PROFILE_STATE_VERSION,
            "profiles": profiles,
        })
    }

    /// Load profiles from a persisted document. Entries with an unknown
    /// type name are skipped with a warning. Returns the number of profiles
    /// loaded.
    pub fn load_from_json(&mut self, document: &Value) -> GraphResult<usize> {
        let root = document
            .as_object()
            .ok_or_else(|| GraphError::ProfileStateMalformed("root is not an object".into()))?;
        let entries = root
            .get("profiles")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                GraphError::ProfileStateMalformed("missing 'profiles' array".into())
            })?;

        let mut loaded = 0usize;
        for entry in entries {
            let object = state_object(entry)?;
            let type_name = object
                .get("typeName")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GraphError::ProfileStateMalformed("profile entry missing 'typeName'".into())
                })?;

            let Some(factory) = self.factories.get(type_name) else {
                log::warn!("skipping profile with unknown type '{type_name}'");
                continue;
            };
            let shared = factory();
            shared.write().load_state(object)?;
            self.insert_shared(shared);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> GraphResult<()> {
        let document = self.save_to_json();
        let mut file = std::fs::File::create(path)?;
        let text = serde_json::to_string_pretty(&document)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> GraphResult<usize> {
        let text = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&text)?;
        self.load_from_json(&document)
    }
}

//--------------------------------------------------------------------------------------------------
