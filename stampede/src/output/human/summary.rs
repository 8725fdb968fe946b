use std::fmt::Write as _;

use stampede_core::{
    ERROR_RATE, ERRORS, LATENCY, MESSAGE_LATENCY, MetricSnapshot, RunReport, SESSION_DURATION,
    SESSION_MESSAGES, split_metric_name,
};

use super::format::{format_duration, format_ms_opt, format_percent, format_rate};

pub(crate) fn render(report: &RunReport) -> String {
    let mut out = String::new();

    out.push_str("summary\n");
    match &report.aborted_by {
        Some(by) => writeln!(out, "  stop: {} ({by})", report.stop_reason).ok(),
        None => writeln!(out, "  stop: {}", report.stop_reason).ok(),
    };
    if let Some(stage) = &report.stage_reached {
        writeln!(
            out,
            "  stage reached: {}/{} {} (target {})",
            stage.stage, stage.stages, stage.kind, stage.target
        )
        .ok();
    }
    writeln!(
        out,
        "  elapsed: {} seed: {}",
        format_duration(report.elapsed),
        report.seed
    )
    .ok();
    let w = &report.workers;
    writeln!(
        out,
        "  workers: spawned={} retired={} peak={} executions={}",
        w.spawned, w.retired, w.peak_live, w.executions
    )
    .ok();
    if w.force_aborted > 0 || w.panicked > 0 {
        writeln!(
            out,
            "  workers lost: aborted={} panicked={}",
            w.force_aborted, w.panicked
        )
        .ok();
    }
    let t = &report.throughput;
    writeln!(
        out,
        "  rps: mean={} stdev={} max={}",
        format_rate(t.rps_mean),
        format_rate(t.rps_stdev),
        format_rate(t.rps_max)
    )
    .ok();

    if !report.metrics.is_empty() {
        out.push_str("\nmetrics\n");
        let width = report.metrics.keys().map(String::len).max().unwrap_or(0);
        for (name, snap) in &report.metrics {
            writeln!(out, "  {name:<width$}  {}", describe(name, snap)).ok();
        }
    }

    if !report.thresholds.is_empty() {
        out.push_str("\nthresholds\n");
        for t in &report.thresholds {
            let mark = if t.passed { "ok  " } else { "FAIL" };
            let observed = t
                .observed
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"));
            write!(out, "  {mark} {} {} (observed {observed})", t.metric, t.expression).ok();
            if let Some(d) = &t.description {
                write!(out, " - {d}").ok();
            }
            out.push('\n');
        }
    }

    writeln!(
        out,
        "\nresult: {} (exit {})",
        if report.passed { "passed" } else { "failed" },
        report.exit_code.as_i32()
    )
    .ok();

    out
}

fn describe(name: &str, snap: &MetricSnapshot) -> String {
    let (base, _) = split_metric_name(name);
    match base {
        LATENCY | SESSION_DURATION | MESSAGE_LATENCY => format!(
            "n={} p50={} p90={} p95={} p99={} mean={} max={}",
            snap.count,
            format_ms_opt(snap.p50),
            format_ms_opt(snap.p90),
            format_ms_opt(snap.p95),
            format_ms_opt(snap.p99),
            format_ms_opt(snap.mean),
            format_ms_opt(snap.max),
        ),
        ERROR_RATE => format!(
            "{} ({}/{})",
            format_percent(snap.rate.unwrap_or(0.0)),
            snap.hits,
            snap.count
        ),
        ERRORS | SESSION_MESSAGES => format!("count={}", snap.count),
        _ => format!("count={} hits={}", snap.count, snap.hits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::{
        ExitCode, HistogramConfig, StopReason, Throughput, ThresholdResult, WorkerStats,
    };
    use stampede_metrics::MetricSeries;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn report() -> RunReport {
        let series = || MetricSeries::new(&HistogramConfig::default()).unwrap_or_else(|e| panic!("{e}"));
        let error_rate = series();
        for i in 0..200 {
            error_rate.record(1_000, i < 3);
        }
        let timeouts = series();
        for _ in 0..3 {
            timeouts.mark(true);
        }

        let mut metrics = BTreeMap::new();
        metrics.insert("error_rate".to_string(), error_rate.snapshot());
        metrics.insert("errors{kind=timeout}".to_string(), timeouts.snapshot());

        RunReport {
            stop_reason: StopReason::ThresholdAbort,
            aborted_by: Some("error_rate rate<0.01".to_string()),
            passed: false,
            exit_code: ExitCode::ThresholdAbort,
            elapsed: Duration::from_secs(65),
            stage_reached: None,
            seed: 42,
            metrics,
            thresholds: vec![ThresholdResult {
                metric: "error_rate".to_string(),
                expression: "rate<0.01".to_string(),
                description: Some("error budget".to_string()),
                passed: false,
                observed: Some(0.015),
            }],
            workers: WorkerStats::default(),
            throughput: Throughput::default(),
            setup_error: None,
            teardown_errors: Vec::new(),
        }
    }

    #[test]
    fn render_lists_metrics_and_thresholds() {
        let out = render(&report());

        assert!(out.contains("stop: threshold_abort (error_rate rate<0.01)"), "{out}");
        assert!(out.contains("elapsed: 1m05s seed: 42"), "{out}");
        assert!(out.contains("1.50% (3/200)"), "{out}");
        assert!(out.contains("errors{kind=timeout}  count=3"), "{out}");
        assert!(
            out.contains("FAIL error_rate rate<0.01 (observed 0.015) - error budget"),
            "{out}"
        );
        assert!(out.contains("result: failed (exit 12)"), "{out}");
    }

    #[test]
    fn session_series_read_as_timings_and_counts() {
        let duration = MetricSeries::new(&HistogramConfig::default()).unwrap_or_else(|e| panic!("{e}"));
        duration.record(90_000_000, true);
        let out = describe("session_duration{scenario=ws}", &duration.snapshot());
        assert!(out.starts_with("n=1 p50="), "{out}");

        let messages = MetricSeries::new(&HistogramConfig::default()).unwrap_or_else(|e| panic!("{e}"));
        for _ in 0..4 {
            messages.mark(true);
        }
        assert_eq!(describe("session_messages", &messages.snapshot()), "count=4");
    }
}
