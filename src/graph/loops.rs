//! Loop manager: named fixed/variable timestep loops.
//!
//! Each loop accumulates frame time and decides once per `update_loops` call
//! whether connected nodes should execute this frame, at which delta. The
//! `LoopReference` address is stable for the manager's lifetime so nodes may
//! cache the pointer across frames.

use std::time::Instant;

use fxhash::FxHashMap;

use crate::error::{GraphError, GraphResult};

/// How a loop handles missed timesteps when the frame runs long.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum LoopCatchupMode {
    /// Execute once with the whole accumulated time as delta.
    FireAndForget,
    /// Execute once with the fixed delta; leftover accumulates as debt.
    SingleCorrectiveStep,
    /// Execute once per `update_loops` call with the fixed delta; the
    /// orchestrator may call again within a frame to drain the accumulator.
    #[default]
    MultipleSteps,
}

/// Per-frame execution state of a loop. Address-stable: the manager boxes
/// each reference and never moves it.
#[derive(Clone, Debug, Default)]
pub struct LoopReference {
    pub loop_id: u32,
    pub should_execute_this_frame: bool,
    pub delta_time: f64,
    pub step_count: u64,
    pub last_executed_frame: u64,
    pub catchup_mode: LoopCatchupMode,
}

/// Configuration for registering a loop.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Update rate in seconds (1/60 for 60 Hz); 0.0 means variable rate.
    pub fixed_timestep: f64,
    pub name: String,
    pub catchup_mode: LoopCatchupMode,
    /// Spiral-of-death protection; frame time is clamped to this.
    pub max_catchup_time: f64,
}

impl LoopConfig {
    pub fn new(fixed_timestep: f64, name: impl Into<String>) -> LoopConfig {
        LoopConfig {
            fixed_timestep,
            name: name.into(),
            catchup_mode: LoopCatchupMode::MultipleSteps,
            max_catchup_time: 0.25,
        }
    }

    pub fn with_catchup_mode(mut self, mode: LoopCatchupMode) -> LoopConfig {
        self.catchup_mode = mode;
        self
    }

    pub fn with_max_catchup_time(mut self, seconds: f64) -> LoopConfig {
        self.max_catchup_time = seconds;
        self
    }
}

struct LoopState {
    config: LoopConfig,
    /// Boxed so the address survives map growth.
    reference: Box<LoopReference>,
    accumulator: f64,
}

//--------------------------------------------------------------------------------------------------

/// Manages loops with independent update rates using the fixed timestep
/// accumulator pattern.
#[derive(Default)]
pub struct LoopManager {
    loops: FxHashMap<u32, LoopState>,
    next_loop_id: u32,
    current_frame_index: u64,
    /// When set, `MultipleSteps` loops consume several steps per
    /// `update_loops` call instead of one, bounded by `max_drain_steps`.
    drain_in_frame: bool,
    max_drain_steps: u32,
}

impl LoopManager {
    pub fn new() -> LoopManager {
        LoopManager {
            max_drain_steps: 8,
            ..LoopManager::default()
        }
    }

    pub fn set_drain_in_frame(&mut self, enabled: bool, max_steps: u32) {
        self.drain_in_frame = enabled;
        self.max_drain_steps = max_steps.max(1);
    }

    pub fn register_loop(&mut self, config: LoopConfig) -> u32 {
        let id = self.next_loop_id;
        self.next_loop_id += 1;

        let reference = Box::new(LoopReference {
            loop_id: id,
            catchup_mode: config.catchup_mode,
            ..LoopReference::default()
        });
        self.loops.insert(
            id,
            LoopState {
                config,
                reference,
                accumulator: 0.0,
            },
        );
        id
    }

    /// Stable reference to the loop's per-frame state. The address never
    /// changes for the manager's lifetime.
    pub fn loop_reference(&self, loop_id: u32) -> GraphResult<&LoopReference> {
        self.loops
            .get(&loop_id)
            .map(|state| &*state.reference)
            .ok_or(GraphError::UnknownLoop(loop_id))
    }

    pub fn loop_name(&self, loop_id: u32) -> Option<&str> {
        self.loops.get(&loop_id).map(|s| s.config.name.as_str())
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Seconds of accumulated, not yet consumed time. Exposed so the
    /// orchestrator can drain `MultipleSteps` loops within a frame.
    pub fn accumulator(&self, loop_id: u32) -> GraphResult<f64> {
        self.loops
            .get(&loop_id)
            .map(|s| s.accumulator)
            .ok_or(GraphError::UnknownLoop(loop_id))
    }

    pub fn set_current_frame(&mut self, frame_index: u64) {
        self.current_frame_index = frame_index;
    }

    /// Advance every loop by `frame_time` seconds and refresh the
    /// references in place.
    pub fn update_loops(&mut self, frame_time: f64) {
        // 1ms floor keeps deltas sane when timers misbehave.
        let frame_time = frame_time.max(0.001);

        for state in self.loops.values_mut() {
            let clamped = frame_time.min(state.config.max_catchup_time);
            let reference = &mut *state.reference;

            if state.config.fixed_timestep == 0.0 {
                // Variable rate loop, always executes.
                reference.should_execute_this_frame = true;
                reference.delta_time = clamped;
                reference.last_executed_frame = self.current_frame_index;
                continue;
            }

            state.accumulator += clamped;
            let step = state.config.fixed_timestep;

            match state.config.catchup_mode {
                LoopCatchupMode::FireAndForget => {
                    if state.accumulator >= step {
                        reference.should_execute_this_frame = true;
                        reference.delta_time = state.accumulator;
                        reference.step_count += 1;
                        reference.last_executed_frame = self.current_frame_index;
                        state.accumulator = 0.0;
                    } else {
                        reference.should_execute_this_frame = false;
                    }
                }
                LoopCatchupMode::SingleCorrectiveStep => {
                    if state.accumulator >= step {
                        reference.should_execute_this_frame = true;
                        reference.delta_time = step;
                        reference.step_count += 1;
                        reference.last_executed_frame = self.current_frame_index;
                        state.accumulator -= step;
                        if state.accumulator > step {
                            log::warn!(
                                "loop '{}' running {:.1}ms behind",
                                state.config.name,
                                state.accumulator * 1000.0
                            );
                        }
                    } else {
                        reference.should_execute_this_frame = false;
                    }
                }
                LoopCatchupMode::MultipleSteps => {
                    // One step per call by default; the orchestrator calls
                    // again within the frame when it wants to drain. With
                    // drain_in_frame set, several steps are consumed here,
                    // reported through step_count.
                    let max_steps = if self.drain_in_frame {
                        self.max_drain_steps
                    } else {
                        1
                    };
                    let mut steps = 0;
                    while state.accumulator >= step && steps < max_steps {
                        state.accumulator -= step;
                        steps += 1;
                    }
                    if steps > 0 {
                        reference.should_execute_this_frame = true;
                        reference.delta_time = step;
                        reference.step_count += steps as u64;
                        reference.last_executed_frame = self.current_frame_index;
                    } else {
                        reference.should_execute_this_frame = false;
                    }
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// Monotonic frame-time source feeding `update_loops`.
pub struct FrameTimer {
    last_tick: Instant,
    first_tick: bool,
}

impl Default for FrameTimer {
    fn default() -> Self {
        FrameTimer::new()
    }
}

impl FrameTimer {
    pub fn new() -> FrameTimer {
        FrameTimer {
            last_tick: Instant::now(),
            first_tick: true,
        }
    }

    /// Seconds since the previous tick. The first tick reports a nominal
    /// 60 Hz frame instead of the arbitrary time since construction.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        if self.first_tick {
            self.first_tick = false;
            1.0 / 60.0
        } else {
            elapsed
        }
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_rate_always_executes() {
        let mut mgr = LoopManager::new();
        let id = mgr.register_loop(LoopConfig::new(0.0, "render"));
        mgr.update_loops(0.016);
        let r = mgr.loop_reference(id).unwrap();
        assert!(r.should_execute_this_frame);
        assert!((r.delta_time - 0.016).abs() < 1e-9);
    }

    #[test]
    fn fixed_rate_skips_until_accumulated() {
        let mut mgr = LoopManager::new();
        let id = mgr.register_loop(LoopConfig::new(1.0 / 60.0, "physics"));
        mgr.update_loops(0.010);
        assert!(!mgr.loop_reference(id).unwrap().should_execute_this_frame);
        mgr.update_loops(0.010);
        let r = mgr.loop_reference(id).unwrap();
        assert!(r.should_execute_this_frame);
        assert!((r.delta_time - 1.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn multiple_steps_single_step_per_call() {
        let mut mgr = LoopManager::new();
        let id = mgr.register_loop(LoopConfig::new(1.0 / 60.0, "physics"));
        // 100ms frame at 60Hz: executes with dt = 1/60, leaves debt.
        mgr.update_loops(0.100);
        let r = mgr.loop_reference(id).unwrap();
        assert!(r.should_execute_this_frame);
        assert!((r.delta_time - 1.0 / 60.0).abs() < 1e-9);
        let debt = mgr.accumulator(id).unwrap();
        assert!(debt > 1.0 / 60.0);

        // Draining: repeated calls with ~zero frame time keep stepping.
        let mut steps = 1;
        while mgr.accumulator(id).unwrap() >= 1.0 / 60.0 {
            mgr.update_loops(0.0);
            if mgr.loop_reference(id).unwrap().should_execute_this_frame {
                steps += 1;
            }
            assert!(steps < 100);
        }
        assert!(mgr.accumulator(id).unwrap() < 1.0 / 60.0);
    }

    #[test]
    fn drain_in_frame_consumes_multiple_steps() {
        let mut mgr = LoopManager::new();
        mgr.set_drain_in_frame(true, 10);
        let id = mgr.register_loop(LoopConfig::new(1.0 / 60.0, "physics"));
        mgr.update_loops(0.100);
        let r = mgr.loop_reference(id).unwrap();
        assert!(r.should_execute_this_frame);
        // 100ms at 60Hz drains 6 full steps in one call.
        assert_eq!(r.step_count, 6);
        assert!(mgr.accumulator(id).unwrap() < 1.0 / 60.0);
    }

    #[test]
    fn fire_and_forget_consumes_whole_accumulator() {
        let mut mgr = LoopManager::new();
        let id = mgr.register_loop(
            LoopConfig::new(1.0 / 60.0, "ui").with_catchup_mode(LoopCatchupMode::FireAndForget),
        );
        mgr.update_loops(0.050);
        let r = mgr.loop_reference(id).unwrap();
        assert!(r.should_execute_this_frame);
        assert!((r.delta_time - 0.050).abs() < 1e-9);
        assert_eq!(mgr.accumulator(id).unwrap(), 0.0);
    }

    #[test]
    fn max_catchup_clamps_frame_time() {
        let mut mgr = LoopManager::new();
        let id = mgr.register_loop(
            LoopConfig::new(1.0 / 60.0, "physics").with_max_catchup_time(0.1),
        );
        mgr.update_loops(5.0);
        assert!(mgr.accumulator(id).unwrap() <= 0.1);
    }

    #[test]
    fn reference_address_stable_across_operations() {
        let mut mgr = LoopManager::new();
        let first = mgr.register_loop(LoopConfig::new(1.0 / 60.0, "a"));
        let addr_before = mgr.loop_reference(first).unwrap() as *const LoopReference;

        // Map growth and updates must not move the reference.
        for i in 0..64 {
            mgr.register_loop(LoopConfig::new(0.0, format!("extra{i}")));
        }
        mgr.set_current_frame(10);
        mgr.update_loops(0.016);

        let addr_after = mgr.loop_reference(first).unwrap() as *const LoopReference;
        assert_eq!(addr_before, addr_after);
    }

    #[test]
    fn unknown_loop_is_an_error() {
        let mgr = LoopManager::new();
        assert!(matches!(
            mgr.loop_reference(42),
            Err(GraphError::UnknownLoop(42))
        ));
    }
}
