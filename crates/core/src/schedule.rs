//! Virtual-user schedule
//!
//! Turns the executor settings of a profile into "how many users should be
//! active at elapsed time t".

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_duration;

/// One ramp stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "serde_duration")]
    pub duration: Duration,
    /// Target VU count reached at the end of the stage
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Upper bound on samples returned by [`Executor::plan`]
pub const MAX_PLAN_POINTS: u32 = 1000;

/// How users are started and stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executor {
    /// Linear ramps between stage targets
    RampingVus { start_vus: u32, stages: Vec<Stage> },
    /// Fixed user count for a fixed duration
    ConstantVus { vus: u32, duration: Duration },
    /// Fixed user count sharing a fixed number of iterations
    SharedIterations {
        vus: u32,
        iterations: u64,
        max_duration: Duration,
    },
}

impl Executor {
    /// Target active users at `elapsed`
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        match self {
            Executor::RampingVus { start_vus, stages } => ramp_target(*start_vus, stages, elapsed),
            Executor::ConstantVus { vus, duration } => {
                if elapsed < *duration {
                    *vus
                } else {
                    0
                }
            }
            Executor::SharedIterations {
                vus, max_duration, ..
            } => {
                if elapsed < *max_duration {
                    *vus
                } else {
                    0
                }
            }
        }
    }

    /// Upper bound on users ever active
    pub fn max_vus(&self) -> u32 {
        match self {
            Executor::RampingVus { start_vus, stages } => stages
                .iter()
                .map(|s| s.target)
                .fold(*start_vus, u32::max),
            Executor::ConstantVus { vus, .. } | Executor::SharedIterations { vus, .. } => *vus,
        }
    }

    /// Scheduled length of the run, excluding graceful stop. Saturates at
    /// `Duration::MAX`; see [`Executor::checked_total_duration`].
    pub fn total_duration(&self) -> Duration {
        self.checked_total_duration().unwrap_or(Duration::MAX)
    }

    /// Scheduled length, or `None` when the stages overflow a `Duration`
    pub fn checked_total_duration(&self) -> Option<Duration> {
        match self {
            Executor::RampingVus { stages, .. } => stages
                .iter()
                .try_fold(Duration::ZERO, |total, s| total.checked_add(s.duration)),
            Executor::ConstantVus { duration, .. } => Some(*duration),
            Executor::SharedIterations { max_duration, .. } => Some(*max_duration),
        }
    }

    /// Iteration budget, if the executor has one
    pub fn iteration_limit(&self) -> Option<u64> {
        match self {
            Executor::SharedIterations { iterations, .. } => Some(*iterations),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Executor::RampingVus { .. } => "ramping-vus",
            Executor::ConstantVus { .. } => "constant-vus",
            Executor::SharedIterations { .. } => "shared-iterations",
        }
    }

    /// Sample the schedule every `step` for display purposes. The step is
    /// widened so no more than [`MAX_PLAN_POINTS`] samples are taken.
    pub fn plan(&self, step: Duration) -> Vec<(Duration, u32)> {
        let total = self.total_duration();
        if step.is_zero() {
            return vec![(Duration::ZERO, self.target_at(Duration::ZERO))];
        }
        let step = step.max(total / MAX_PLAN_POINTS);
        let mut points = Vec::new();
        let mut t = Duration::ZERO;
        while t < total {
            points.push((t, self.target_at(t)));
            t = match t.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        points.push((total, self.target_at(total)));
        points
    }
}

fn ramp_target(start_vus: u32, stages: &[Stage], elapsed: Duration) -> u32 {
    let mut from = start_vus;
    let mut stage_start = Duration::ZERO;

    for stage in stages {
        let stage_end = stage_start.saturating_add(stage.duration);
        if elapsed < stage_end {
            let into = (elapsed - stage_start).as_secs_f64();
            let progress = into / stage.duration.as_secs_f64();
            let from_f = from as f64;
            let to_f = stage.target as f64;
            return (from_f + (to_f - from_f) * progress).floor() as u32;
        }
        from = stage.target;
        stage_start = stage_end;
    }

    0
}
