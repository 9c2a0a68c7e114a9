// Inspect command: show the resolved profile without running it

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use loadline_core::{format_duration, ProfileOverrides};
use serde_json::json;

use crate::commands::run::load_profile;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

pub fn run(script: &Path, step: Duration, output: OutputFormat) -> Result<()> {
    let profile = load_profile(script, &ProfileOverrides::default())?;
    let executor = profile.executor()?;
    let thresholds = profile.threshold_set()?;
    let plan = executor.plan(step);

    if !output.is_text() {
        let schedule: Vec<_> = plan
            .iter()
            .map(|(at, vus)| json!({ "at": format_duration(*at), "vus": vus }))
            .collect();
        return output.print_value(&json!({
            "profile": profile,
            "executor": executor.name(),
            "max_vus": executor.max_vus(),
            "total_duration": format_duration(executor.total_duration()),
            "iterations": executor.iteration_limit(),
            "schedule": schedule,
        }));
    }

    print_field("Target", &profile.target);
    print_field("Executor", executor.name());
    print_field("Max VUs", &executor.max_vus().to_string());
    print_field("Duration", &format_duration(executor.total_duration()));
    if let Some(iterations) = executor.iteration_limit() {
        print_field("Iterations", &iterations.to_string());
    }
    print_field("Think time", &format_duration(profile.think_time));
    print_field("Timeout", &format_duration(profile.request_timeout));
    print_field("Graceful stop", &format_duration(profile.graceful_stop));

    let check_names: Vec<&str> = profile.checks.iter().map(|c| c.name.as_str()).collect();
    print_field("Checks", &check_names.join(", "));

    if thresholds.is_empty() {
        print_field("Thresholds", "none");
    } else {
        println!("Thresholds:");
        for threshold in thresholds.iter() {
            let abort = if threshold.abort_on_fail {
                " (abort on fail)"
            } else {
                ""
            };
            println!("  {}: {}{}", threshold.metric, threshold.expr.source(), abort);
        }
    }

    println!();
    print_table_header(&[("AT", 10), ("VUS", 6)]);
    for (at, vus) in &plan {
        print_table_row(&[(&format_duration(*at), 10), (&vus.to_string(), 6)]);
    }

    Ok(())
}
