use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use stampede_metrics::{MetricSnapshot, Registry};

use crate::aggregator::Aggregator;
use crate::error::ConfigError;

/// Why a threshold expression did not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThresholdParseError {
    #[error("expected `<aggregation> <comparison> <value>`, e.g. `p(95) < 500ms`")]
    Shape,

    #[error("unknown comparison `{0}`")]
    Comparison(String),

    #[error("unknown aggregation `{0}`")]
    Aggregation(String),

    #[error("percentile {0} is outside 1..=100")]
    Percentile(u32),

    #[error("`{0}` is not a finite number")]
    Value(String),

    #[error("`{0}` is compared with a plain number; units only apply to timings")]
    Unit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl FromStr for ThresholdOp {
    type Err = ThresholdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "==" => Ok(Self::Eq),
            other => Err(ThresholdParseError::Comparison(other.to_string())),
        }
    }
}

/// What a threshold reads from a metric snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Count,
    Rate,
    P(u8),
}

impl ThresholdAgg {
    /// Reads a latency in milliseconds.
    pub fn is_timing(self) -> bool {
        !matches!(self, Self::Count | Self::Rate)
    }
}

impl FromStr for ThresholdAgg {
    type Err = ThresholdParseError;

    /// `avg`/`mean`, `min`, `max`, `med`, `count`, `rate`, `p(N)` or `pN`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.to_ascii_lowercase();
        match name.as_str() {
            "avg" | "mean" => return Ok(Self::Avg),
            "min" => return Ok(Self::Min),
            "max" => return Ok(Self::Max),
            "med" => return Ok(Self::P(50)),
            "count" => return Ok(Self::Count),
            "rate" => return Ok(Self::Rate),
            _ => {}
        }

        let digits = name
            .strip_prefix("p(")
            .and_then(|rest| rest.strip_suffix(')'))
            .or_else(|| name.strip_prefix('p'))
            .map(str::trim)
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| ThresholdParseError::Aggregation(s.to_string()))?;
        let p: u32 = digits
            .parse()
            .map_err(|_| ThresholdParseError::Aggregation(s.to_string()))?;
        match u8::try_from(p) {
            Ok(p) if (1..=100).contains(&p) => Ok(Self::P(p)),
            _ => Err(ThresholdParseError::Percentile(p)),
        }
    }
}

/// `<aggregation> <comparison> <value>`. Timing values are milliseconds unless suffixed with
/// `ms` or `s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();
        let at = s.find(['<', '>', '=']).ok_or(ThresholdParseError::Shape)?;
        let (agg, rest) = s.split_at(at);
        let op_len = if rest[1..].starts_with('=') { 2 } else { 1 };
        let (op, value) = rest.split_at(op_len);

        let agg = agg.trim();
        let value = value.trim();
        if agg.is_empty() || value.is_empty() {
            return Err(ThresholdParseError::Shape);
        }

        let agg: ThresholdAgg = agg.parse()?;
        let op: ThresholdOp = op.parse()?;

        let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
            (n, Some(1.0))
        } else if let Some(n) = value.strip_suffix('s') {
            (n, Some(1_000.0))
        } else {
            (value, None)
        };
        if scale.is_some() && !agg.is_timing() {
            return Err(ThresholdParseError::Unit(value.to_string()));
        }
        let number: f64 = number
            .trim()
            .parse()
            .map_err(|_| ThresholdParseError::Value(value.to_string()))?;
        if !number.is_finite() {
            return Err(ThresholdParseError::Value(value.to_string()));
        }

        Ok(Self {
            agg,
            op,
            value: number * scale.unwrap_or(1.0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: String,
    pub expr: ThresholdExpr,
    pub description: Option<String>,
    /// Stop the run as soon as this threshold fails during `Running`.
    pub abort_on_fail: bool,
    /// No abort checks before this much of the run has elapsed.
    pub abort_grace: Duration,
}

impl ThresholdSpec {
    pub fn new(metric: impl Into<String>, expression: impl Into<String>) -> Result<Self, ConfigError> {
        let metric = metric.into();
        let expression = expression.into();
        let expr = expression
            .parse()
            .map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric.clone(),
                expression: expression.clone(),
                reason,
            })?;

        Ok(Self {
            metric,
            expression,
            expr,
            description: None,
            abort_on_fail: false,
            abort_grace: Duration::ZERO,
        })
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn abort_on_fail(mut self, grace: Duration) -> Self {
        self.abort_on_fail = true;
        self.abort_grace = grace;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub passed: bool,
    pub observed: Option<f64>,
}

/// Source of metric snapshots for threshold evaluation.
pub trait SnapshotProvider {
    fn snapshot(&self, metric: &str) -> Option<MetricSnapshot>;
}

impl SnapshotProvider for Registry {
    fn snapshot(&self, metric: &str) -> Option<MetricSnapshot> {
        Registry::snapshot(self, metric)
    }
}

impl SnapshotProvider for Aggregator {
    fn snapshot(&self, metric: &str) -> Option<MetricSnapshot> {
        Aggregator::snapshot(self, metric)
    }
}

impl SnapshotProvider for BTreeMap<String, MetricSnapshot> {
    fn snapshot(&self, metric: &str) -> Option<MetricSnapshot> {
        self.get(metric).cloned()
    }
}

/// Evaluates every spec. A missing metric, or an aggregation the series cannot provide, fails
/// with no observed value.
pub fn evaluate<'a, P>(
    specs: impl IntoIterator<Item = &'a ThresholdSpec>,
    provider: &P,
) -> Vec<ThresholdResult>
where
    P: SnapshotProvider + ?Sized,
{
    let mut cache: BTreeMap<&str, Option<MetricSnapshot>> = BTreeMap::new();

    specs
        .into_iter()
        .map(|spec| {
            let snapshot = cache
                .entry(spec.metric.as_str())
                .or_insert_with(|| provider.snapshot(&spec.metric));
            let observed = snapshot
                .as_ref()
                .and_then(|s| observed_value(s, spec.expr.agg));
            let passed = observed.is_some_and(|v| compare(v, spec.expr.op, spec.expr.value));

            ThresholdResult {
                metric: spec.metric.clone(),
                expression: spec.expression.clone(),
                description: spec.description.clone(),
                passed,
                observed,
            }
        })
        .collect()
}

pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.passed)
}

fn observed_value(snapshot: &MetricSnapshot, agg: ThresholdAgg) -> Option<f64> {
    match agg {
        ThresholdAgg::Count => Some(snapshot.count as f64),
        ThresholdAgg::Rate => snapshot.rate,
        ThresholdAgg::Avg => snapshot.mean,
        ThresholdAgg::Min => snapshot.min,
        ThresholdAgg::Max => snapshot.max,
        ThresholdAgg::P(p) => snapshot.percentile(p),
    }
}

fn compare(observed: f64, op: ThresholdOp, expected: f64) -> bool {
    match op {
        ThresholdOp::Lt => observed < expected,
        ThresholdOp::Lte => observed <= expected,
        ThresholdOp::Gt => observed > expected,
        ThresholdOp::Gte => observed >= expected,
        ThresholdOp::Eq => observed == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_metrics::HistogramConfig;

    fn spec(metric: &str, expr: &str) -> ThresholdSpec {
        ThresholdSpec::new(metric, expr).unwrap_or_else(|e| panic!("{e}"))
    }

    fn expr(raw: &str) -> ThresholdExpr {
        raw.parse().unwrap_or_else(|e| panic!("`{raw}`: {e}"))
    }

    fn registry() -> Registry {
        Registry::new(HistogramConfig::default()).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn percentiles_accept_call_and_short_forms() {
        for raw in ["p(95)<500", "p95 < 500", "P( 95 )<500"] {
            let e = expr(raw);
            assert_eq!((e.agg, e.op, e.value), (ThresholdAgg::P(95), ThresholdOp::Lt, 500.0));
        }
        assert_eq!(expr("med <= 20").agg, ThresholdAgg::P(50));
        assert_eq!(expr("mean>=1").agg, ThresholdAgg::Avg);
    }

    #[test]
    fn timing_values_take_units() {
        assert_eq!(expr("p(99) < 1.5s").value, 1_500.0);
        assert_eq!(expr("avg < 250ms").value, 250.0);
        assert_eq!(expr("max == 3").value, 3.0);
        assert_eq!(
            "rate < 1s".parse::<ThresholdExpr>(),
            Err(ThresholdParseError::Unit("1s".to_string()))
        );
    }

    #[test]
    fn malformed_expressions_name_the_problem() {
        let cases = [
            ("", ThresholdParseError::Shape),
            ("avg 3", ThresholdParseError::Shape),
            ("<5", ThresholdParseError::Shape),
            ("count >", ThresholdParseError::Shape),
            ("avg = 3", ThresholdParseError::Comparison("=".to_string())),
            ("median < 3", ThresholdParseError::Aggregation("median".to_string())),
            ("p(0)<1", ThresholdParseError::Percentile(0)),
            ("p101<1", ThresholdParseError::Percentile(101)),
            ("rate<abc", ThresholdParseError::Value("abc".to_string())),
            ("rate<inf", ThresholdParseError::Value("inf".to_string())),
        ];
        for (raw, want) in cases {
            assert_eq!(raw.parse::<ThresholdExpr>(), Err(want), "`{raw}`");
        }
    }

    #[test]
    fn invalid_expression_is_a_config_error() {
        let err = ThresholdSpec::new("latency", "p(200)<5");
        assert!(matches!(err, Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn missing_metric_fails_threshold() {
        let registry = registry();
        let results = evaluate(&[spec("nope", "count>0")], &registry);
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert!(results[0].observed.is_none());
    }

    #[test]
    fn error_rate_threshold_boundary() {
        for (failures, should_pass) in [(3, true), (6, false)] {
            let registry = registry();
            let series = registry.series("error_rate");
            for i in 0..100 {
                series.record(1_000, i < failures);
            }

            let results = evaluate(&[spec("error_rate", "rate<0.05")], &registry);
            assert_eq!(results[0].passed, should_pass, "{failures}/100 failures");
            assert_eq!(results[0].observed, Some(failures as f64 / 100.0));
        }
    }

    #[test]
    fn percentile_without_samples_fails() {
        let registry = registry();
        registry.series("errors{kind=timeout}").mark(true);

        let results = evaluate(
            &[
                spec("errors{kind=timeout}", "count<5"),
                spec("errors{kind=timeout}", "p(95)<5"),
            ],
            &registry,
        );
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].observed.is_none());
    }

    #[test]
    fn overall_verdict_is_and_of_results() {
        let registry = registry();
        let series = registry.series("latency");
        for ms in [10, 20, 30] {
            series.record(ms * 1_000, true);
        }

        let results = evaluate(
            &[spec("latency", "avg<100"), spec("latency", "max<25")],
            &registry,
        );
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert!(!all_passed(&results));
        assert!(all_passed(&results[..1]));
    }
}
