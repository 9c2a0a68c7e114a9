// Load Runner Core
//
// This crate turns a declarative load profile into concurrent HTTP traffic
// and a pass/fail verdict.
//
// Key design decisions:
// - Profiles are data (YAML/JSON), validated up front before any request is sent
// - One tokio task per virtual user; a controller loop sets how many are active
// - Scenario is a trait so scheduling is testable with paused time and no sockets
// - Metrics are lock-light recorders shared by all users (atomics + parking_lot)
// - Non-2xx responses only fail checks; http_req_failed counts transport failures
// - Thresholds are evaluated at run end; abort_on_fail ones also during the run

pub mod check;
pub mod duration;
pub mod http;
pub mod metrics;
pub mod profile;
pub mod runner;
pub mod scenario;
pub mod schedule;
pub mod summary;
pub mod threshold;

// Re-export key types at crate root
pub use check::{default_checks, Check, CheckKind};
pub use duration::{format_duration, format_elapsed, parse_duration, DurationError};
pub use http::{HttpScenario, HttpScenarioError};
pub use metrics::{MetricKind, MetricSummary, RunMetrics};
pub use profile::{LoadProfile, ProfileError, ProfileOverrides};
pub use runner::LoadRunner;
pub use scenario::{IterationContext, Scenario};
pub use schedule::{Executor, Stage};
pub use summary::RunReport;
pub use threshold::{ThresholdError, ThresholdResult, ThresholdSet, ThresholdSpec};
