// Integration tests for HttpScenario driven by LoadRunner against local servers
// Run with: cargo test -p loadline-core --test http_run_test

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use loadline_core::metrics::{MetricSummary, HTTP_REQ_DURATION, HTTP_REQ_FAILED, HTTP_REQS};
use loadline_core::{HttpScenario, LoadProfile, LoadRunner};

/// Serve `app` on an ephemeral port and return its address
async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on
fn unreachable_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn benchmark_thresholds(profile: LoadProfile) -> LoadProfile {
    profile
        .with_threshold(HTTP_REQ_DURATION, "p(95)<1000")
        .with_threshold(HTTP_REQ_FAILED, "rate<0.01")
}

fn rate(report: &loadline_core::RunReport, name: &str) -> f64 {
    match &report.metrics[name] {
        MetricSummary::Rate(r) => r.rate,
        other => panic!("{} is not a rate: {:?}", name, other),
    }
}

#[tokio::test]
async fn test_hello_world_passes_all_checks() {
    let app = Router::new().route(
        "/",
        get(|| async { axum::Json(serde_json::json!({"message": "Hello World!"})) }),
    );
    let addr = spawn_server(app).await;

    let profile = benchmark_thresholds(
        LoadProfile::new(format!("http://{}/", addr))
            .with_vus(1)
            .with_iterations(2),
    );
    let scenario = Arc::new(HttpScenario::from_profile(&profile).unwrap());
    let runner = LoadRunner::new(profile).unwrap();

    let report = runner.run(scenario).await;

    assert!(report.thresholds_passed());
    assert_eq!(report.checks["status 200"].passes, 2);
    assert_eq!(report.checks["body is not empty"].passes, 2);
    assert_eq!(rate(&report, "checks"), 1.0);
    assert_eq!(runner.metrics().http_reqs.total(), 2);
    assert_eq!(
        runner.metrics().data_received.total(),
        2 * r#"{"message":"Hello World!"}"#.len() as u64
    );
    // Two iterations, each followed by a one-second sleep
    assert!(report.duration >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_server_error_fails_check_but_not_thresholds() {
    let app = Router::new().route(
        "/",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let addr = spawn_server(app).await;

    let profile = benchmark_thresholds(
        LoadProfile::new(format!("http://{}/", addr))
            .with_vus(1)
            .with_iterations(1),
    );
    let scenario = Arc::new(HttpScenario::from_profile(&profile).unwrap());
    let report = LoadRunner::new(profile).unwrap().run(scenario).await;

    assert_eq!(report.checks["status 200"].fails, 1);
    assert_eq!(report.checks["body is not empty"].passes, 1);
    assert_eq!(rate(&report, HTTP_REQ_FAILED), 0.0);
    assert!(report.thresholds_passed());
}

#[tokio::test]
async fn test_unreachable_server_breaches_failure_threshold() {
    let addr = unreachable_addr();

    let profile = benchmark_thresholds(
        LoadProfile::new(format!("http://{}/", addr))
            .with_vus(1)
            .with_iterations(2),
    );
    let scenario = Arc::new(HttpScenario::from_profile(&profile).unwrap());
    let report = LoadRunner::new(profile).unwrap().run(scenario).await;

    assert_eq!(report.checks["status 200"].fails, 2);
    assert_eq!(report.checks["body is not empty"].fails, 2);
    assert_eq!(rate(&report, "checks"), 0.0);
    assert_eq!(rate(&report, HTTP_REQ_FAILED), 1.0);
    match &report.metrics[HTTP_REQS] {
        MetricSummary::Counter(c) => assert_eq!(c.count, 2),
        other => panic!("unexpected summary: {:?}", other),
    }

    let failed: Vec<_> = report.failed_thresholds().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].metric, HTTP_REQ_FAILED);
    assert!(!report.thresholds_passed());
}

#[tokio::test]
async fn test_unmatched_route_is_a_check_failure() {
    let app = Router::new().route("/", get(|| async { "ok" }));
    let addr = spawn_server(app).await;

    let profile = LoadProfile::new(format!("http://{}/missing", addr)).with_iterations(1);
    let scenario = Arc::new(HttpScenario::from_profile(&profile).unwrap());
    let report = LoadRunner::new(profile).unwrap().run(scenario).await;

    assert_eq!(report.checks["status 200"].fails, 1);
    assert!(report.thresholds.is_empty());
}
