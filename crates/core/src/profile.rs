//! Load profile (the load script)
//!
//! A profile names the target, how users are scheduled, what each response
//! is checked for, and which aggregate thresholds decide pass/fail.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::{default_checks, Check};
use crate::duration::{option_serde_duration, serde_duration};
use crate::metrics::builtin_kind;
use crate::schedule::{Executor, Stage};
use crate::threshold::{ThresholdError, ThresholdSet, ThresholdSpec};

/// Default pause after each iteration
pub const DEFAULT_THINK_TIME: Duration = Duration::from_secs(1);
/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Default grace period for in-flight iterations at run end
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
/// Upper bound on a shared-iterations run when no duration is given
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

/// Profile loading and validation errors
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML profile: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON profile: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid target URL '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("'stages' cannot be combined with 'vus', 'duration' or 'iterations'")]
    ConflictingExecutor,

    #[error("profile schedules no work: {0}")]
    EmptySchedule(String),

    #[error("stage durations add up to more than the longest supported run")]
    ScheduleTooLong,

    #[error(transparent)]
    Threshold(#[from] ThresholdError),
}

/// A load script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadProfile {
    /// URL every iteration requests with GET
    pub target: String,

    /// Ramp stages; mutually exclusive with `vus`/`duration`/`iterations`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,

    /// Users active at the start of a ramp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_vus: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vus: Option<u32>,

    #[serde(
        default,
        with = "option_serde_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,

    /// Metric name -> threshold expressions
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdSpec>>,

    #[serde(default = "default_checks")]
    pub checks: Vec<Check>,

    #[serde(default = "default_think_time", with = "serde_duration")]
    pub think_time: Duration,

    #[serde(default = "default_request_timeout", with = "serde_duration")]
    pub request_timeout: Duration,

    #[serde(default = "default_graceful_stop", with = "serde_duration")]
    pub graceful_stop: Duration,
}

fn default_think_time() -> Duration {
    DEFAULT_THINK_TIME
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_graceful_stop() -> Duration {
    DEFAULT_GRACEFUL_STOP
}

/// Command-line overrides applied on top of a loaded profile
#[derive(Debug, Clone, Default)]
pub struct ProfileOverrides {
    pub target: Option<String>,
    pub vus: Option<u32>,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
}

impl LoadProfile {
    /// A profile with no schedule: one user, one iteration
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            stages: Vec::new(),
            start_vus: None,
            vus: None,
            duration: None,
            iterations: None,
            thresholds: BTreeMap::new(),
            checks: default_checks(),
            think_time: DEFAULT_THINK_TIME,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
        }
    }

    /// Load from a file; `.json` is read as JSON, anything else as YAML
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ProfileError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ProfileError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_vus(mut self, vus: u32) -> Self {
        self.vus = Some(vus);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn with_threshold(mut self, metric: impl Into<String>, expr: impl Into<String>) -> Self {
        self.thresholds
            .entry(metric.into())
            .or_default()
            .push(ThresholdSpec::Expr(expr.into()));
        self
    }

    pub fn with_checks(mut self, checks: Vec<Check>) -> Self {
        self.checks = checks;
        self
    }

    /// Apply command-line overrides. Any schedule override replaces the
    /// profile's stages.
    pub fn apply_overrides(&mut self, overrides: &ProfileOverrides) {
        if let Some(target) = &overrides.target {
            self.target = target.clone();
        }
        if overrides.vus.is_some() || overrides.duration.is_some() || overrides.iterations.is_some()
        {
            self.stages.clear();
            self.start_vus = None;
        }
        if let Some(vus) = overrides.vus {
            self.vus = Some(vus);
        }
        if let Some(duration) = overrides.duration {
            self.duration = Some(duration);
        }
        if let Some(iterations) = overrides.iterations {
            self.iterations = Some(iterations);
        }
    }

    /// Parsed target URL
    pub fn target_url(&self) -> Result<Url, ProfileError> {
        let url = Url::parse(&self.target).map_err(|e| ProfileError::InvalidTarget {
            target: self.target.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ProfileError::InvalidTarget {
                target: self.target.clone(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    /// Resolve which executor this profile describes
    pub fn executor(&self) -> Result<Executor, ProfileError> {
        if !self.stages.is_empty() {
            if self.vus.is_some() || self.duration.is_some() || self.iterations.is_some() {
                return Err(ProfileError::ConflictingExecutor);
            }
            let executor = Executor::RampingVus {
                start_vus: self.start_vus.unwrap_or(1),
                stages: self.stages.clone(),
            };
            let total = executor
                .checked_total_duration()
                .ok_or(ProfileError::ScheduleTooLong)?;
            if total.is_zero() {
                return Err(ProfileError::EmptySchedule(
                    "stages add up to zero duration".to_string(),
                ));
            }
            if executor.max_vus() == 0 {
                return Err(ProfileError::EmptySchedule(
                    "start_vus and every stage target are 0".to_string(),
                ));
            }
            return Ok(executor);
        }

        let vus = self.vus.unwrap_or(1);
        if vus == 0 {
            return Err(ProfileError::EmptySchedule("vus must be at least 1".to_string()));
        }

        match (self.iterations, self.duration) {
            (Some(0), _) => Err(ProfileError::EmptySchedule(
                "iterations must be at least 1".to_string(),
            )),
            (Some(iterations), duration) => Ok(Executor::SharedIterations {
                vus,
                iterations,
                max_duration: duration.unwrap_or(DEFAULT_MAX_DURATION),
            }),
            (None, Some(duration)) if duration.is_zero() => Err(ProfileError::EmptySchedule(
                "duration must be greater than zero".to_string(),
            )),
            (None, Some(duration)) => Ok(Executor::ConstantVus { vus, duration }),
            (None, None) => Ok(Executor::SharedIterations {
                vus,
                iterations: 1,
                max_duration: DEFAULT_MAX_DURATION,
            }),
        }
    }

    /// Parse and validate thresholds against the built-in metrics
    pub fn threshold_set(&self) -> Result<ThresholdSet, ProfileError> {
        Ok(ThresholdSet::build(&self.thresholds, builtin_kind)?)
    }

    /// Validate everything that can be checked before running
    pub fn validate(&self) -> Result<(), ProfileError> {
        self.target_url()?;
        self.executor()?;
        self.threshold_set()?;
        Ok(())
    }
}
