//! Pass/fail thresholds over aggregate metrics
//!
//! An expression has the form `<aggregation> <operator> <number>`, for
//! example `p(95)<10`, `rate<0.01` or `count >= 100`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{MetricKind, MetricSummary};

/// Threshold-related errors
#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("invalid threshold '{expr}': missing comparison operator")]
    MissingOperator { expr: String },

    #[error("invalid threshold '{expr}': unknown aggregation '{aggregation}'")]
    UnknownAggregation { expr: String, aggregation: String },

    #[error("invalid threshold '{expr}': '{value}' is not a number")]
    InvalidValue { expr: String, value: String },

    #[error("invalid threshold '{expr}': percentile must be between 0 and 100")]
    PercentileOutOfRange { expr: String },

    #[error("unknown metric '{metric}' in thresholds")]
    UnknownMetric { metric: String },

    #[error("aggregation '{aggregation}' is not available on {kind} metric '{metric}'")]
    UnsupportedAggregation {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },
}

/// Aggregation a threshold compares against
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Rate,
    Count,
    Value,
}

impl Aggregation {
    /// Whether this aggregation exists for a metric kind
    pub fn supports(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Avg
            | Aggregation::Min
            | Aggregation::Max
            | Aggregation::Med
            | Aggregation::Percentile(_) => kind == MetricKind::Trend || self.gauge_ok(kind),
            Aggregation::Rate => matches!(kind, MetricKind::Rate | MetricKind::Counter),
            Aggregation::Count => kind == MetricKind::Counter,
            Aggregation::Value => kind == MetricKind::Gauge,
        }
    }

    fn gauge_ok(&self, kind: MetricKind) -> bool {
        kind == MetricKind::Gauge && matches!(self, Aggregation::Min | Aggregation::Max)
    }

    /// Extract the aggregated value from a summary. Missing data reads as 0.
    pub fn resolve(&self, summary: &MetricSummary) -> f64 {
        match (self, summary) {
            (Aggregation::Avg, MetricSummary::Trend(t)) => t.avg,
            (Aggregation::Min, MetricSummary::Trend(t)) => t.min,
            (Aggregation::Max, MetricSummary::Trend(t)) => t.max,
            (Aggregation::Med, MetricSummary::Trend(t)) => t.med,
            (Aggregation::Percentile(p), MetricSummary::Trend(t)) => t.percentile(*p),
            (Aggregation::Rate, MetricSummary::Rate(r)) => r.rate,
            (Aggregation::Rate, MetricSummary::Counter(c)) => c.rate,
            (Aggregation::Count, MetricSummary::Counter(c)) => c.count as f64,
            (Aggregation::Value, MetricSummary::Gauge(g)) => g.value as f64,
            (Aggregation::Min, MetricSummary::Gauge(g)) => g.min as f64,
            (Aggregation::Max, MetricSummary::Gauge(g)) => g.max as f64,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({})", p),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Value => f.write_str("value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            Operator::Lt => left < right,
            Operator::Le => left <= right,
            Operator::Gt => left > right,
            Operator::Ge => left >= right,
            Operator::Eq => left == right,
            Operator::Ne => left != right,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }
}

/// A parsed threshold expression
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub operator: Operator,
    pub value: f64,
    source: String,
}

impl ThresholdExpr {
    /// The expression as written in the load script
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a summary, returning the observed value and the verdict
    pub fn evaluate(&self, summary: &MetricSummary) -> (f64, bool) {
        let observed = self.aggregation.resolve(summary);
        (observed, self.operator.compare(observed, self.value))
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.operator.as_str(), self.value)
    }
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        // Two-character operators first so "<=" is not read as "<"
        const OPERATORS: [(&str, Operator); 6] = [
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ];

        let (pos, token, operator) = OPERATORS
            .iter()
            .filter_map(|(token, op)| expr.find(token).map(|pos| (pos, *token, *op)))
            .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
            .ok_or_else(|| ThresholdError::MissingOperator {
                expr: expr.to_string(),
            })?;

        let left = expr[..pos].trim();
        let right = expr[pos + token.len()..].trim();

        let aggregation = parse_aggregation(expr, left)?;
        let value: f64 = right.parse().map_err(|_| ThresholdError::InvalidValue {
            expr: expr.to_string(),
            value: right.to_string(),
        })?;

        Ok(Self {
            aggregation,
            operator,
            value,
            source: expr.trim().to_string(),
        })
    }
}

fn parse_aggregation(expr: &str, name: &str) -> Result<Aggregation, ThresholdError> {
    let compact: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    let aggregation = match compact.as_str() {
        "avg" => Aggregation::Avg,
        "min" => Aggregation::Min,
        "max" => Aggregation::Max,
        "med" => Aggregation::Med,
        "rate" => Aggregation::Rate,
        "count" => Aggregation::Count,
        "value" => Aggregation::Value,
        other => {
            let inner = other
                .strip_prefix("p(")
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| ThresholdError::UnknownAggregation {
                    expr: expr.to_string(),
                    aggregation: name.to_string(),
                })?;
            let p: f64 = inner.parse().map_err(|_| ThresholdError::InvalidValue {
                expr: expr.to_string(),
                value: inner.to_string(),
            })?;
            if !(0.0..=100.0).contains(&p) {
                return Err(ThresholdError::PercentileOutOfRange {
                    expr: expr.to_string(),
                });
            }
            Aggregation::Percentile(p)
        }
    };
    Ok(aggregation)
}

/// A threshold as written in a load script: either a bare expression or
/// an object with options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdSpec {
    pub fn expression(&self) -> &str {
        match self {
            ThresholdSpec::Expr(expr) => expr,
            ThresholdSpec::Detailed { threshold, .. } => threshold,
        }
    }

    pub fn abort_on_fail(&self) -> bool {
        matches!(
            self,
            ThresholdSpec::Detailed {
                abort_on_fail: true,
                ..
            }
        )
    }
}

/// A validated threshold bound to a metric
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expr: ThresholdExpr,
    pub abort_on_fail: bool,
}

impl Threshold {
    fn result(&self, observed: f64, passed: bool) -> ThresholdResult {
        ThresholdResult {
            metric: self.metric.clone(),
            threshold: self.expr.source().to_string(),
            observed,
            passed,
        }
    }
}

/// Outcome of evaluating one threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub threshold: String,
    pub observed: f64,
    pub passed: bool,
}

/// All thresholds of a profile
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

impl ThresholdSet {
    /// Parse and validate thresholds keyed by metric name.
    ///
    /// `kind_of` resolves a metric name to its kind; unknown metrics are
    /// rejected, as are aggregations the metric kind does not provide.
    pub fn build(
        specs: &BTreeMap<String, Vec<ThresholdSpec>>,
        kind_of: impl Fn(&str) -> Option<MetricKind>,
    ) -> Result<Self, ThresholdError> {
        let mut thresholds = Vec::new();
        for (metric, entries) in specs {
            let kind = kind_of(metric).ok_or_else(|| ThresholdError::UnknownMetric {
                metric: metric.clone(),
            })?;
            for spec in entries {
                let expr: ThresholdExpr = spec.expression().parse()?;
                if !expr.aggregation.supports(kind) {
                    return Err(ThresholdError::UnsupportedAggregation {
                        metric: metric.clone(),
                        kind,
                        aggregation: expr.aggregation.to_string(),
                    });
                }
                thresholds.push(Threshold {
                    metric: metric.clone(),
                    expr,
                    abort_on_fail: spec.abort_on_fail(),
                });
            }
        }
        Ok(Self { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    /// Whether any threshold may abort the run early
    pub fn has_abort_on_fail(&self) -> bool {
        self.thresholds.iter().any(|t| t.abort_on_fail)
    }

    /// Evaluate every threshold. `summary_of` returns the metric aggregate;
    /// a missing metric reads as zero.
    pub fn evaluate(
        &self,
        summary_of: impl Fn(&str) -> Option<MetricSummary>,
    ) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|t| {
                let (observed, passed) = match summary_of(&t.metric) {
                    Some(summary) => t.expr.evaluate(&summary),
                    None => (0.0, t.expr.operator.compare(0.0, t.expr.value)),
                };
                t.result(observed, passed)
            })
            .collect()
    }

    /// Evaluate only the thresholds marked `abort_on_fail`, returning the
    /// first breach if any. Metrics with no samples yet are skipped rather
    /// than read as zero.
    pub fn first_abort_breach(
        &self,
        summary_of: impl Fn(&str) -> Option<MetricSummary>,
    ) -> Option<ThresholdResult> {
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .filter_map(|t| {
                let summary = summary_of(&t.metric).filter(MetricSummary::has_samples)?;
                let (observed, passed) = t.expr.evaluate(&summary);
                Some(t.result(observed, passed))
            })
            .find(|result| !result.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{builtin_kind, RateSummary, Trend};

    #[test]
    fn test_parse_percentile_threshold() {
        let expr: ThresholdExpr = "p(95)<10".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(95.0));
        assert_eq!(expr.operator, Operator::Lt);
        assert_eq!(expr.value, 10.0);
        assert_eq!(expr.source(), "p(95)<10");
    }

    #[test]
    fn test_parse_operators_and_whitespace() {
        let expr: ThresholdExpr = "rate <= 0.01".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Rate);
        assert_eq!(expr.operator, Operator::Le);

        let expr: ThresholdExpr = "count>=100".parse().unwrap();
        assert_eq!(expr.operator, Operator::Ge);

        let expr: ThresholdExpr = "p( 99.9 ) != 3".parse().unwrap();
        assert_eq!(expr.aggregation, Aggregation::Percentile(99.9));
        assert_eq!(expr.operator, Operator::Ne);

        let expr: ThresholdExpr = "value==0".parse().unwrap();
        assert_eq!(expr.operator, Operator::Eq);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "p(95)".parse::<ThresholdExpr>(),
            Err(ThresholdError::MissingOperator { .. })
        ));
        assert!(matches!(
            "mean<3".parse::<ThresholdExpr>(),
            Err(ThresholdError::UnknownAggregation { .. })
        ));
        assert!(matches!(
            "avg<fast".parse::<ThresholdExpr>(),
            Err(ThresholdError::InvalidValue { .. })
        ));
        assert!(matches!(
            "p(101)<3".parse::<ThresholdExpr>(),
            Err(ThresholdError::PercentileOutOfRange { .. })
        ));
    }

    #[test]
    fn test_build_rejects_unknown_metric_and_bad_aggregation() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_bogus".to_string(),
            vec![ThresholdSpec::Expr("avg<1".into())],
        );
        assert!(matches!(
            ThresholdSet::build(&specs, builtin_kind),
            Err(ThresholdError::UnknownMetric { .. })
        ));

        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::Expr("p(95)<1".into())],
        );
        assert!(matches!(
            ThresholdSet::build(&specs, builtin_kind),
            Err(ThresholdError::UnsupportedAggregation { .. })
        ));
    }

    #[test]
    fn test_evaluate_against_summaries() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_duration".to_string(),
            vec![ThresholdSpec::Expr("p(95)<10".into())],
        );
        specs.insert(
            "http_req_failed".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate<0.01".into(),
                abort_on_fail: true,
            }],
        );
        let set = ThresholdSet::build(&specs, builtin_kind).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.has_abort_on_fail());

        let trend = Trend::new();
        for ms in [2.0, 3.0, 4.0, 50.0] {
            trend.record_ms(ms);
        }
        let duration = MetricSummary::Trend(trend.summary());
        let failed = MetricSummary::Rate(RateSummary {
            rate: 0.0,
            passes: 0,
            fails: 10,
        });

        let results = set.evaluate(|name| match name {
            "http_req_duration" => Some(duration.clone()),
            "http_req_failed" => Some(failed.clone()),
            _ => None,
        });

        let latency = results.iter().find(|r| r.metric == "http_req_duration").unwrap();
        assert!(!latency.passed);
        assert!(latency.observed > 10.0);

        let errors = results.iter().find(|r| r.metric == "http_req_failed").unwrap();
        assert!(errors.passed);
    }

    #[test]
    fn test_missing_metric_reads_as_zero() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_reqs".to_string(),
            vec![ThresholdSpec::Expr("count>0".into())],
        );
        let set = ThresholdSet::build(&specs, builtin_kind).unwrap();

        let results = set.evaluate(|_| None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].observed, 0.0);
        assert!(!results[0].passed);
    }

    #[test]
    fn test_first_abort_breach_only_considers_abort_thresholds() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "http_req_failed".to_string(),
            vec![
                ThresholdSpec::Expr("rate<0.5".into()),
                ThresholdSpec::Detailed {
                    threshold: "rate<0.9".into(),
                    abort_on_fail: true,
                },
            ],
        );
        let set = ThresholdSet::build(&specs, builtin_kind).unwrap();

        let half = MetricSummary::Rate(RateSummary {
            rate: 0.6,
            passes: 6,
            fails: 4,
        });
        assert!(set.first_abort_breach(|_| Some(half.clone())).is_none());

        let all = MetricSummary::Rate(RateSummary {
            rate: 1.0,
            passes: 10,
            fails: 0,
        });
        let breach = set.first_abort_breach(|_| Some(all.clone())).unwrap();
        assert_eq!(breach.threshold, "rate<0.9");
    }

    #[test]
    fn test_first_abort_breach_skips_metrics_without_samples() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "checks".to_string(),
            vec![ThresholdSpec::Detailed {
                threshold: "rate>0.99".into(),
                abort_on_fail: true,
            }],
        );
        let set = ThresholdSet::build(&specs, builtin_kind).unwrap();

        let empty = MetricSummary::Rate(RateSummary::default());
        assert!(set.first_abort_breach(|_| Some(empty.clone())).is_none());
        assert!(set.first_abort_breach(|_| None).is_none());

        // The end-of-run evaluation still reads an empty metric as zero
        let results = set.evaluate(|_| Some(empty.clone()));
        assert!(!results[0].passed);
    }

    #[test]
    fn test_threshold_spec_deserializes_both_forms() {
        let specs: Vec<ThresholdSpec> = serde_json::from_str(
            r#"["p(95)<10", {"threshold": "rate<0.01", "abort_on_fail": true}]"#,
        )
        .unwrap();
        assert_eq!(specs[0].expression(), "p(95)<10");
        assert!(!specs[0].abort_on_fail());
        assert_eq!(specs[1].expression(), "rate<0.01");
        assert!(specs[1].abort_on_fail());
    }
}
