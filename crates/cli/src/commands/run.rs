// Run command: execute a profile and report thresholds

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use loadline_core::{HttpScenario, LoadProfile, LoadRunner, ProfileOverrides, RunReport};
use tracing::info;

use crate::output::OutputFormat;

pub struct RunOptions {
    pub script: PathBuf,
    pub overrides: ProfileOverrides,
    pub summary_export: Option<PathBuf>,
    pub no_thresholds: bool,
}

/// Load the profile the way `run` would, overrides included
pub fn load_profile(script: &Path, overrides: &ProfileOverrides) -> Result<LoadProfile> {
    let mut profile = LoadProfile::from_path(script)
        .with_context(|| format!("Failed to load profile {}", script.display()))?;
    profile.apply_overrides(overrides);
    profile
        .validate()
        .with_context(|| format!("Invalid profile {}", script.display()))?;
    Ok(profile)
}

/// Returns whether every threshold passed
pub async fn run(options: RunOptions, output: OutputFormat, quiet: bool) -> Result<bool> {
    let profile = load_profile(&options.script, &options.overrides)?;

    let scenario = Arc::new(
        HttpScenario::from_profile(&profile).context("Failed to build HTTP scenario")?,
    );
    let mut runner = LoadRunner::new(profile)?;
    if options.no_thresholds {
        runner = runner.without_thresholds();
    }

    info!(script = %options.script.display(), "Running profile");
    let report = runner.run(scenario).await;

    if let Some(path) = &options.summary_export {
        export_summary(&report, path)?;
        info!(path = %path.display(), "Summary exported");
    }

    if output.is_text() {
        if !quiet {
            println!();
            print!("{}", report.render_text());
        }
    } else {
        output.print_value(&report)?;
    }

    let passed = report.thresholds_passed();
    if !passed {
        for breach in report.failed_thresholds() {
            tracing::error!(
                metric = %breach.metric,
                threshold = %breach.threshold,
                observed = breach.observed,
                "Threshold breached"
            );
        }
    }
    Ok(passed)
}

fn export_summary(report: &RunReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to encode summary")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write summary to {}", path.display()))
}
