//! HTTP GET scenario
//!
//! One request per iteration, no retries. Transport failures are recorded
//! in `http_req_failed`; non-2xx statuses are valid responses that only
//! fail the checks.

use std::time::Instant;

use bytes::Bytes;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, trace};

use crate::check::Check;
use crate::metrics::RunMetrics;
use crate::profile::{LoadProfile, ProfileError};
use crate::scenario::{IterationContext, Scenario};

#[derive(Debug, Error)]
pub enum HttpScenarioError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Issues a GET against the profile target and evaluates its checks
pub struct HttpScenario {
    client: reqwest::Client,
    url: Url,
    checks: Vec<Check>,
}

impl HttpScenario {
    pub fn from_profile(profile: &LoadProfile) -> Result<Self, HttpScenarioError> {
        let url = profile.target_url()?;
        let client = reqwest::Client::builder()
            .timeout(profile.request_timeout)
            .user_agent(concat!("loadline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url,
            checks: profile.checks.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch(&self) -> Result<(u16, Bytes), reqwest::Error> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok((status, body))
    }

    fn record_checks(&self, metrics: &RunMetrics, outcome: Option<(u16, &[u8])>) {
        for check in &self.checks {
            let passed = match outcome {
                Some((status, body)) => check.evaluate(status, body),
                None => false,
            };
            metrics.record_check(&check.name, passed);
        }
    }
}

impl Scenario for HttpScenario {
    async fn iteration(&self, ctx: &IterationContext) {
        let metrics = &ctx.metrics;
        let started = Instant::now();
        let result = self.fetch().await;
        let elapsed = started.elapsed();

        metrics.http_reqs.increment();

        match result {
            Ok((status, body)) => {
                trace!(
                    vu = ctx.vu,
                    iteration = ctx.iteration,
                    status,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "response received"
                );
                metrics.http_req_duration.record(elapsed);
                metrics.http_req_failed.record(false);
                metrics.data_received.increment_by(body.len() as u64);
                self.record_checks(metrics, Some((status, &body)));
            }
            Err(e) => {
                debug!(vu = ctx.vu, iteration = ctx.iteration, error = %e, "request failed");
                metrics.http_req_failed.record(true);
                self.record_checks(metrics, None);
            }
        }
    }
}
