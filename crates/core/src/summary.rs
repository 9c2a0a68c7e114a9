//! End-of-run report
//!
//! The report is what the CLI prints and exports; it holds only aggregates,
//! never individual requests.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::{format_elapsed, serde_duration};
use crate::metrics::{CheckTally, MetricSummary, DATA_RECEIVED};
use crate::threshold::ThresholdResult;

/// Result of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub target: String,
    pub executor: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "serde_duration")]
    pub duration: Duration,
    pub vus_max: u32,
    /// In-flight iterations cut off, either when the graceful stop expired
    /// or when an `abort_on_fail` breach stopped the run
    pub iterations_interrupted: u64,
    /// Threshold whose breach stopped the run early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<ThresholdResult>,
    pub checks: BTreeMap<String, CheckTally>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub thresholds: Vec<ThresholdResult>,
}

impl RunReport {
    /// True when every evaluated threshold passed
    pub fn thresholds_passed(&self) -> bool {
        self.aborted_by.is_none() && self.thresholds.iter().all(|t| t.passed)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    /// Render the human-readable summary
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "  target:   {}", self.target);
        let _ = writeln!(
            out,
            "  executor: {} (max {} VUs, {})",
            self.executor,
            self.vus_max,
            format_elapsed(self.duration)
        );
        out.push('\n');

        for (name, tally) in &self.checks {
            let mark = if tally.fails == 0 { '✓' } else { '✗' };
            let _ = writeln!(out, "     {} {}", mark, name);
            if tally.fails > 0 {
                let total = tally.passes + tally.fails;
                let pct = tally.passes as f64 / total as f64 * 100.0;
                let _ = writeln!(
                    out,
                    "      ↳  {:.0}% ✓ {} / ✗ {}",
                    pct, tally.passes, tally.fails
                );
            }
        }
        if !self.checks.is_empty() {
            out.push('\n');
        }

        for (name, summary) in &self.metrics {
            let results: Vec<&ThresholdResult> = self
                .thresholds
                .iter()
                .filter(|t| &t.metric == name)
                .collect();
            let mark = if results.is_empty() {
                ' '
            } else if results.iter().all(|t| t.passed) {
                '✓'
            } else {
                '✗'
            };

            let _ = writeln!(
                out,
                "   {} {:.<32}: {}",
                mark,
                name,
                format_summary(name, summary)
            );
            for result in results {
                let _ = writeln!(
                    out,
                    "       {} {{ {} }} observed {:.4}",
                    if result.passed { '✓' } else { '✗' },
                    result.threshold,
                    result.observed
                );
            }
        }

        if self.iterations_interrupted > 0 {
            let _ = writeln!(
                out,
                "\n  {} iteration(s) interrupted",
                self.iterations_interrupted
            );
        }

        if let Some(breach) = &self.aborted_by {
            let _ = writeln!(
                out,
                "\n  run aborted: threshold {{ {} }} on {} crossed",
                breach.threshold, breach.metric
            );
        }

        let verdict = if self.thresholds.is_empty() && self.aborted_by.is_none() {
            "no thresholds defined"
        } else if self.thresholds_passed() {
            "all thresholds passed"
        } else {
            "thresholds breached"
        };
        let _ = writeln!(out, "\n  {}", verdict);

        out
    }
}

fn format_summary(name: &str, summary: &MetricSummary) -> String {
    match summary {
        MetricSummary::Trend(t) => format!(
            "avg={} min={} med={} max={} p(90)={} p(95)={}",
            format_millis(t.avg),
            format_millis(t.min),
            format_millis(t.med),
            format_millis(t.max),
            format_millis(t.p90),
            format_millis(t.p95)
        ),
        MetricSummary::Rate(r) => format!(
            "{:.2}% ✓ {} ✗ {}",
            r.rate * 100.0,
            r.passes,
            r.fails
        ),
        MetricSummary::Counter(c) if name == DATA_RECEIVED => {
            format!("{} {}/s", format_bytes(c.count as f64), format_bytes(c.rate))
        }
        MetricSummary::Counter(c) => format!("{} {:.2}/s", c.count, c.rate),
        MetricSummary::Gauge(g) => format!("{} min={} max={}", g.value, g.min, g.max),
    }
}

fn format_millis(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else if ms >= 1.0 {
        format!("{:.2}ms", ms)
    } else {
        format!("{:.2}µs", ms * 1000.0)
    }
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
