//! Load runner
//!
//! Spawns one task per virtual user up front (`vus_max`) and lets a
//! controller loop decide how many of them are active. Each active user
//! repeats: iteration, record, think-time sleep.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::duration::{format_duration, format_elapsed};
use crate::metrics::RunMetrics;
use crate::profile::{LoadProfile, ProfileError};
use crate::scenario::{IterationContext, Scenario};
use crate::schedule::Executor;
use crate::summary::RunReport;
use crate::threshold::ThresholdSet;

/// How often the controller re-reads the schedule
pub const CONTROL_INTERVAL: Duration = Duration::from_millis(100);
/// How often `abort_on_fail` thresholds are evaluated during a run
pub const ABORT_EVAL_INTERVAL: Duration = Duration::from_secs(2);
/// How often progress is logged
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// State shared by the controller and every virtual user
struct VuShared {
    /// No new iterations once cancelled
    stop: CancellationToken,
    /// In-flight iterations are abandoned once cancelled
    hard_stop: CancellationToken,
    iteration_limit: Option<u64>,
    claimed: AtomicU64,
    active: AtomicU32,
    interrupted: AtomicU64,
    think_time: Duration,
    metrics: Arc<RunMetrics>,
}

impl VuShared {
    fn claim_iteration(&self) -> bool {
        match self.iteration_limit {
            None => true,
            Some(limit) => self.claimed.fetch_add(1, Ordering::AcqRel) < limit,
        }
    }
}

/// Runs a load profile against a scenario
///
/// A runner is meant for a single run; metrics accumulate across calls to
/// [`LoadRunner::run`].
pub struct LoadRunner {
    profile: LoadProfile,
    executor: Executor,
    thresholds: ThresholdSet,
    metrics: Arc<RunMetrics>,
}

impl LoadRunner {
    pub fn new(profile: LoadProfile) -> Result<Self, ProfileError> {
        profile.validate()?;
        let executor = profile.executor()?;
        let thresholds = profile.threshold_set()?;

        Ok(Self {
            profile,
            executor,
            thresholds,
            metrics: Arc::new(RunMetrics::new()),
        })
    }

    /// Skip threshold evaluation (and early aborts) entirely
    pub fn without_thresholds(mut self) -> Self {
        self.thresholds = ThresholdSet::default();
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Live metrics, e.g. for progress reporting
    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    /// Run the profile to completion
    pub async fn run<S: Scenario>(&self, scenario: Arc<S>) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let max_vus = self.executor.max_vus();
        let total = self.executor.total_duration();

        info!(
            target_url = %self.profile.target,
            executor = self.executor.name(),
            max_vus,
            duration = %format_duration(total),
            thresholds = self.thresholds.len(),
            "Starting load run"
        );

        let shared = Arc::new(VuShared {
            stop: CancellationToken::new(),
            hard_stop: CancellationToken::new(),
            iteration_limit: self.executor.iteration_limit(),
            claimed: AtomicU64::new(0),
            active: AtomicU32::new(0),
            interrupted: AtomicU64::new(0),
            think_time: self.profile.think_time,
            metrics: self.metrics.clone(),
        });
        self.metrics.vus_max.set(max_vus as i64);

        let (target_tx, target_rx) = watch::channel(self.executor.target_at(Duration::ZERO));
        let mut vus = JoinSet::new();
        for index in 0..max_vus {
            vus.spawn(run_vu(
                index,
                scenario.clone(),
                shared.clone(),
                target_rx.clone(),
            ));
        }
        drop(target_rx);

        let mut ticker = tokio::time::interval(CONTROL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_abort_eval = start;
        let mut last_progress = start;
        let mut aborted_by = None;

        loop {
            tokio::select! {
                joined = vus.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!(error = %e, "Virtual user task failed"),
                    None => {
                        debug!("All virtual users finished");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let elapsed = now - start;
                    target_tx.send_replace(self.executor.target_at(elapsed));
                    self.metrics
                        .vus
                        .set(shared.active.load(Ordering::Relaxed) as i64);

                    if elapsed >= total {
                        debug!(elapsed = %format_elapsed(elapsed), "Schedule complete");
                        break;
                    }

                    if now - last_progress >= PROGRESS_INTERVAL {
                        last_progress = now;
                        info!(
                            elapsed = %format_elapsed(elapsed),
                            vus = shared.active.load(Ordering::Relaxed),
                            iterations = self.metrics.iterations.total(),
                            requests = self.metrics.http_reqs.total(),
                            "Progress"
                        );
                    }

                    if self.thresholds.has_abort_on_fail()
                        && now - last_abort_eval >= ABORT_EVAL_INTERVAL
                    {
                        last_abort_eval = now;
                        let breach = self
                            .thresholds
                            .first_abort_breach(|name| self.metrics.summary(name, elapsed));
                        if let Some(breach) = breach {
                            warn!(
                                metric = %breach.metric,
                                threshold = %breach.threshold,
                                observed = breach.observed,
                                "Threshold crossed, aborting run"
                            );
                            aborted_by = Some(breach);
                            break;
                        }
                    }
                }
            }
        }

        shared.stop.cancel();
        if aborted_by.is_some() {
            shared.hard_stop.cancel();
        }

        let graceful_stop = self.profile.graceful_stop;
        if tokio::time::timeout(graceful_stop, drain(&mut vus))
            .await
            .is_err()
        {
            warn!(
                graceful_stop = %format_duration(graceful_stop),
                "Graceful stop expired, interrupting in-flight iterations"
            );
            shared.hard_stop.cancel();
            drain(&mut vus).await;
        }

        let duration = start.elapsed();
        let thresholds = self
            .thresholds
            .evaluate(|name| self.metrics.summary(name, duration));

        info!(
            duration = %format_elapsed(duration),
            iterations = self.metrics.iterations.total(),
            requests = self.metrics.http_reqs.total(),
            failed_thresholds = thresholds.iter().filter(|t| !t.passed).count(),
            "Load run complete"
        );

        RunReport {
            target: self.profile.target.clone(),
            executor: self.executor.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            duration,
            vus_max: max_vus,
            iterations_interrupted: shared.interrupted.load(Ordering::Relaxed),
            aborted_by,
            checks: self.metrics.check_tallies(),
            metrics: self.metrics.summaries(duration),
            thresholds,
        }
    }
}

async fn drain(vus: &mut JoinSet<()>) {
    while let Some(result) = vus.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Virtual user task failed");
        }
    }
}

async fn run_vu<S: Scenario>(
    index: u32,
    scenario: Arc<S>,
    shared: Arc<VuShared>,
    mut target: watch::Receiver<u32>,
) {
    let mut iteration = 0u64;
    let mut active = false;

    loop {
        if shared.stop.is_cancelled() {
            break;
        }

        let current = *target.borrow_and_update();
        if index >= current {
            if active {
                shared.active.fetch_sub(1, Ordering::Relaxed);
                active = false;
            }
            let woken = tokio::select! {
                _ = shared.stop.cancelled() => false,
                changed = async { target.wait_for(|t| *t > index).await.is_ok() } => changed,
            };
            if !woken {
                break;
            }
            continue;
        }

        if !shared.claim_iteration() {
            break;
        }
        if !active {
            shared.active.fetch_add(1, Ordering::Relaxed);
            active = true;
        }

        let ctx = IterationContext {
            vu: index + 1,
            iteration,
            metrics: shared.metrics.clone(),
        };
        let started = Instant::now();

        // Exactly one think-time sleep follows every iteration
        let completed = tokio::select! {
            _ = shared.hard_stop.cancelled() => false,
            _ = async {
                scenario.iteration(&ctx).await;
                tokio::time::sleep(shared.think_time).await;
            } => true,
        };

        if !completed {
            shared.interrupted.fetch_add(1, Ordering::Relaxed);
            break;
        }

        shared.metrics.iterations.increment();
        shared.metrics.iteration_duration.record(started.elapsed());
        iteration += 1;
    }

    if active {
        shared.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSummary;
    use crate::schedule::Stage;
    use crate::threshold::ThresholdSpec;

    /// Counts iterations and optionally takes time or fails its request
    #[derive(Default)]
    struct FakeScenario {
        calls: AtomicU64,
        work: Duration,
        fail: bool,
        /// Outcome of the `ok` check recorded after the request, if any
        check: Option<bool>,
    }

    impl Scenario for FakeScenario {
        async fn iteration(&self, ctx: &IterationContext) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            ctx.metrics.http_reqs.increment();
            ctx.metrics.http_req_failed.record(self.fail);
            if let Some(passed) = self.check {
                ctx.metrics.record_check("ok", passed);
            }
        }
    }

    fn profile() -> LoadProfile {
        LoadProfile::new("http://127.0.0.1:3000/")
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_iteration_sleeps_once() {
        let scenario = Arc::new(FakeScenario::default());
        let runner = LoadRunner::new(profile().with_vus(1).with_iterations(1)).unwrap();

        let report = runner.run(scenario.clone()).await;

        assert_eq!(scenario.calls.load(Ordering::Relaxed), 1);
        assert_eq!(runner.metrics().iterations.total(), 1);
        assert!(report.duration >= Duration::from_secs(1));
        assert!(report.duration < Duration::from_secs(2));

        match &report.metrics["iteration_duration"] {
            MetricSummary::Trend(t) => {
                assert_eq!(t.count, 1);
                assert!((t.avg - 1000.0).abs() < 1.0);
            }
            other => panic!("unexpected summary: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_iterations_still_sleep_once() {
        let scenario = Arc::new(FakeScenario {
            fail: true,
            ..Default::default()
        });
        let runner = LoadRunner::new(profile().with_vus(1).with_iterations(2)).unwrap();

        let report = runner.run(scenario.clone()).await;

        assert_eq!(scenario.calls.load(Ordering::Relaxed), 2);
        assert_eq!(runner.metrics().http_req_failed.summary().rate, 1.0);
        assert!(report.duration >= Duration::from_secs(2));
        assert!(report.duration < Duration::from_secs(3));

        match &report.metrics["iteration_duration"] {
            MetricSummary::Trend(t) => {
                assert_eq!(t.count, 2);
                assert!((t.avg - 1000.0).abs() < 1.0);
            }
            other => panic!("unexpected summary: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_vus_iterate_once_per_second() {
        let scenario = Arc::new(FakeScenario::default());
        let runner = LoadRunner::new(
            profile()
                .with_vus(2)
                .with_duration(Duration::from_millis(2500)),
        )
        .unwrap();

        let report = runner.run(scenario.clone()).await;

        // Iterations start at 0s, 1s and 2s for each user
        assert_eq!(scenario.calls.load(Ordering::Relaxed), 6);
        assert_eq!(runner.metrics().iterations.total(), 6);
        assert_eq!(report.iterations_interrupted, 0);
        assert_eq!(report.vus_max, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_iterations_are_not_exceeded() {
        let scenario = Arc::new(FakeScenario::default());
        let runner = LoadRunner::new(profile().with_vus(3).with_iterations(7)).unwrap();

        runner.run(scenario.clone()).await;

        assert_eq!(scenario.calls.load(Ordering::Relaxed), 7);
        assert_eq!(runner.metrics().iterations.total(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_interrupts_long_iterations() {
        let scenario = Arc::new(FakeScenario {
            work: Duration::from_secs(10),
            ..Default::default()
        });
        let mut profile = profile().with_vus(1).with_duration(Duration::from_secs(1));
        profile.graceful_stop = Duration::from_secs(2);
        let runner = LoadRunner::new(profile).unwrap();

        let report = runner.run(scenario).await;

        assert_eq!(report.iterations_interrupted, 1);
        assert_eq!(runner.metrics().iterations.total(), 0);
        assert!(report.duration < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_fail_stops_run_early() {
        let scenario = Arc::new(FakeScenario {
            fail: true,
            ..Default::default()
        });
        let mut profile = profile().with_vus(1).with_duration(Duration::from_secs(60));
        profile.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate<0.5".to_string(),
                abort_on_fail: true,
            }],
        );
        let runner = LoadRunner::new(profile).unwrap();

        let report = runner.run(scenario).await;

        let breach = report.aborted_by.as_ref().expect("run should abort");
        assert_eq!(breach.metric, "http_req_failed");
        assert!(report.duration < Duration::from_secs(10));
        assert!(!report.thresholds_passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_waits_for_first_sample() {
        // Nothing is recorded before the first response arrives at 3s
        let scenario = Arc::new(FakeScenario {
            work: Duration::from_secs(3),
            check: Some(true),
            ..Default::default()
        });
        let mut profile = profile().with_vus(1).with_duration(Duration::from_secs(10));
        profile.thresholds.insert(
            "checks".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate>0.99".to_string(),
                abort_on_fail: true,
            }],
        );
        let runner = LoadRunner::new(profile).unwrap();

        let report = runner.run(scenario).await;

        assert!(report.aborted_by.is_none(), "aborted: {:?}", report.aborted_by);
        assert!(report.checks["ok"].passes >= 2);
        assert_eq!(report.checks["ok"].fails, 0);
        assert!(report.thresholds_passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_counts_cut_off_iteration_as_interrupted() {
        // First sample lands at 5s; the 6s evaluation catches the user mid-sleep
        let scenario = Arc::new(FakeScenario {
            work: Duration::from_secs(5),
            fail: true,
            ..Default::default()
        });
        let mut profile = profile()
            .with_vus(1)
            .with_duration(Duration::from_secs(60))
            .with_think_time(Duration::from_millis(1500));
        profile.thresholds.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate<0.5".to_string(),
                abort_on_fail: true,
            }],
        );
        let runner = LoadRunner::new(profile).unwrap();

        let report = runner.run(scenario).await;

        assert!(report.aborted_by.is_some());
        assert_eq!(report.iterations_interrupted, 1);
        assert_eq!(runner.metrics().iterations.total(), 0);
        assert!(report.duration < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramping_respects_stage_targets() {
        let scenario = Arc::new(FakeScenario::default());
        let mut profile = profile().with_stages(vec![
            Stage::new(Duration::from_secs(4), 4),
            Stage::new(Duration::from_secs(4), 0),
        ]);
        profile.start_vus = Some(0);
        let runner = LoadRunner::new(profile).unwrap();

        let report = runner.run(scenario.clone()).await;

        assert_eq!(report.executor, "ramping-vus");
        assert_eq!(report.vus_max, 4);
        match &report.metrics["vus"] {
            MetricSummary::Gauge(g) => assert!(g.max <= 4 && g.max >= 3),
            other => panic!("unexpected summary: {:?}", other),
        }
        let calls = scenario.calls.load(Ordering::Relaxed);
        // Never more than max_vus iterations per second over 8 seconds
        assert!(calls > 0 && calls <= 32, "calls = {}", calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_thresholds_skips_evaluation() {
        let scenario = Arc::new(FakeScenario {
            fail: true,
            ..Default::default()
        });
        let runner = LoadRunner::new(
            profile()
                .with_iterations(1)
                .with_threshold("http_req_failed", "rate<0.01"),
        )
        .unwrap()
        .without_thresholds();

        let report = runner.run(scenario).await;

        assert!(report.thresholds.is_empty());
        assert!(report.thresholds_passed());
    }
}
