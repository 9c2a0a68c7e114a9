// Loadline CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json/yaml output formats for scripting.
// Design Decision: Logs go to stderr so stdout stays machine-readable.
// Design Decision: Exit 99 when a threshold is breached, 1 on any other error.

mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use loadline_core::parse_duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status when at least one threshold fails
pub const THRESHOLDS_BREACHED: u8 = 99;

#[derive(Parser)]
#[command(name = "loadline")]
#[command(about = "Loadline - Run staged HTTP load profiles with pass/fail thresholds")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    /// Suppress progress logs and the text summary
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Log level for progress output (overridden by RUST_LOG)
    #[arg(long, global = true, env = "LOADLINE_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load profile
    Run {
        /// Profile file (.yaml, .yml or .json)
        script: PathBuf,

        /// Override the target URL
        #[arg(long, short)]
        url: Option<String>,

        /// Run a constant number of virtual users instead of the profile's stages
        #[arg(long)]
        vus: Option<u32>,

        /// Run for a fixed duration, e.g. 30s or 1m30s
        #[arg(long, short, value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Run a fixed number of iterations shared by all users
        #[arg(long, short)]
        iterations: Option<u64>,

        /// Write the end-of-test summary as JSON to this file
        #[arg(long)]
        summary_export: Option<PathBuf>,

        /// Run without evaluating thresholds
        #[arg(long)]
        no_thresholds: bool,
    },

    /// Show the resolved profile and its user schedule without running it
    Inspect {
        /// Profile file (.yaml, .yml or .json)
        script: PathBuf,

        /// Sampling step for the schedule table
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        step: Duration,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.quiet);

    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Run {
            script,
            url,
            vus,
            duration,
            iterations,
            summary_export,
            no_thresholds,
        } => {
            let options = commands::run::RunOptions {
                script,
                overrides: loadline_core::ProfileOverrides {
                    target: url,
                    vus,
                    duration,
                    iterations,
                },
                summary_export,
                no_thresholds,
            };
            let passed = commands::run::run(options, output_format, cli.quiet).await?;
            Ok(if passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(THRESHOLDS_BREACHED)
            })
        }
        Commands::Inspect { script, step } => {
            commands::inspect::run(&script, step, output_format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(level: &str, quiet: bool) {
    let level = if quiet { "warn" } else { level };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("loadline={level},loadline_core={level}", level = level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
