//! The unit of work each virtual user repeats

use std::future::Future;
use std::sync::Arc;

use crate::metrics::RunMetrics;

/// Per-iteration context handed to a scenario
#[derive(Clone)]
pub struct IterationContext {
    /// 1-based virtual user number
    pub vu: u32,
    /// 0-based iteration number within this user
    pub iteration: u64,
    /// Shared recorders for request and check metrics
    pub metrics: Arc<RunMetrics>,
}

/// Trait for load scenarios
///
/// The runner records `iterations` and `iteration_duration` and performs
/// the think-time sleep; a scenario only records what it measures itself.
pub trait Scenario: Send + Sync + 'static {
    /// Execute a single iteration
    fn iteration(&self, ctx: &IterationContext) -> impl Future<Output = ()> + Send;
}
