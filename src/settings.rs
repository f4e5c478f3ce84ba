//! Runtime settings.
//!
//! Loaded from an optional `Settings` file merged with `RENDERGRAPH_*`
//! environment overrides. Everything has a default; the graph never
//! requires a settings file to exist.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Worker threads for the task pool; 0 means hardware concurrency.
    pub executor_threads: usize,
    /// Run every level sequentially (debugging aid).
    pub disable_parallel_execution: bool,
    /// Frame budget driving the capacity tracker, in milliseconds.
    pub frame_budget_ms: f64,
    /// Consecutive under-budget frames before a pressure valve opens.
    pub frames_before_increase: u32,
    /// Path for task-profile calibration persistence.
    pub profile_state_path: String,
    /// Mirror node loggers to the terminal.
    pub mirror_logs: bool,
    /// Allow the orchestrator to drain MultipleSteps loops within a frame.
    pub drain_loops_in_frame: bool,
    /// Cap on drain iterations per frame when draining is enabled.
    pub max_loop_steps_per_frame: u32,
}

impl Default for GraphSettings {
    fn default() -> Self {
        GraphSettings {
            executor_threads: 0,
            disable_parallel_execution: false,
            frame_budget_ms: 16.0,
            frames_before_increase: 120,
            profile_state_path: String::from("task_profiles.json"),
            mirror_logs: false,
            drain_loops_in_frame: false,
            max_loop_steps_per_frame: 8,
        }
    }
}

impl GraphSettings {
    /// Load `Settings.{toml,json,yaml}` from the working directory if
    /// present, then apply `RENDERGRAPH_*` environment overrides. Falls
    /// back to defaults on any error.
    pub fn load() -> GraphSettings {
        let built = config::Config::builder()
            .add_source(config::File::with_name("Settings").required(false))
            .add_source(config::Environment::with_prefix("RENDERGRAPH"))
            .build();
        match built.and_then(|cfg| cfg.try_deserialize::<GraphSettings>()) {
            Ok(settings) => settings,
            Err(err) => {
                log::warn!("settings unavailable ({err}), using defaults");
                GraphSettings::default()
            }
        }
    }

    pub fn frame_budget_ns(&self) -> u64 {
        (self.frame_budget_ms * 1_000_000.0) as u64
    }
}

//--------------------------------------------------------------------------------------------------
