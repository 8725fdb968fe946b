use serde::Serialize;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use super::OutputFormatter;
use crate::config::RunPlan;

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _config_path: &Path, _plan: &RunPlan) {}

    fn progress(&self) -> Option<stampede_core::ProgressFn> {
        Some(Arc::new(move |u| {
            let line = build_progress_line(&u);
            emit_json_line(&line);
        }))
    }

    fn print_summary(&self, report: &stampede_core::RunReport) -> anyhow::Result<()> {
        emit_json_line(&JsonSummaryLine {
            kind: "summary",
            report,
        });
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonProgressLine {
    pub kind: &'static str,
    pub tick: u64,
    pub state: stampede_core::RunState,
    pub elapsed_secs: f64,
    pub total_secs: f64,

    pub stage: usize,
    pub stages: usize,
    pub stage_kind: stampede_core::StageKind,
    pub stage_remaining_secs: f64,
    pub target_vus: u64,
    pub live_vus: u64,

    pub outcomes_total: u64,
    pub failures_total: u64,
    pub rps: f64,
    pub error_rate: f64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

fn build_progress_line(u: &stampede_core::ProgressUpdate) -> JsonProgressLine {
    JsonProgressLine {
        kind: "progress",
        tick: u.tick,
        state: u.state,
        elapsed_secs: u.elapsed.as_secs_f64(),
        total_secs: u.total_duration.as_secs_f64(),

        stage: u.stage.stage,
        stages: u.stage.stages,
        stage_kind: u.stage.kind,
        stage_remaining_secs: u.stage.stage_remaining.as_secs_f64(),
        target_vus: u.stage.current_target,
        live_vus: u.live_workers,

        outcomes_total: u.outcomes_total,
        failures_total: u.failures_total,
        rps: u.rps_now,
        error_rate: u.error_rate_now,
        latency_p50_ms: u.latency_p50_ms,
        latency_p95_ms: u.latency_p95_ms,
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSummaryLine<'a> {
    pub kind: &'static str,
    #[serde(flatten)]
    pub report: &'a stampede_core::RunReport,
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use stampede_core::{
        ExitCode, ProgressUpdate, RunReport, RunState, StageKind, StageProgress, StopReason,
        Throughput, WorkerStats,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn progress_line_has_kind_and_stage() {
        let update = ProgressUpdate {
            tick: 3,
            state: RunState::Running,
            elapsed: Duration::from_secs(3),
            total_duration: Duration::from_secs(60),
            stage: StageProgress {
                stage: 1,
                stages: 2,
                kind: StageKind::Ramp,
                stage_elapsed: Duration::from_secs(3),
                stage_remaining: Duration::from_secs(27),
                start_target: 0,
                end_target: 10,
                current_target: 1,
            },
            live_workers: 1,
            outcomes_total: 4,
            failures_total: 1,
            rps_now: 2.0,
            error_rate_now: 0.5,
            latency_p50_ms: Some(12.0),
            latency_p95_ms: None,
        };

        let v: Value = match serde_json::to_value(build_progress_line(&update)) {
            Ok(v) => v,
            Err(err) => panic!("to_value failed: {err}"),
        };
        assert_eq!(v.get("kind").and_then(Value::as_str), Some("progress"));
        assert_eq!(v.get("stage_kind").and_then(Value::as_str), Some("ramp"));
        assert_eq!(v.get("target_vus").and_then(Value::as_u64), Some(1));
        assert_eq!(v.get("latency_p95_ms"), Some(&Value::Null));
    }

    #[test]
    fn summary_line_flattens_the_report() {
        let report = RunReport {
            stop_reason: StopReason::Completed,
            aborted_by: None,
            passed: true,
            exit_code: ExitCode::Success,
            elapsed: Duration::from_millis(1500),
            stage_reached: None,
            seed: 7,
            metrics: BTreeMap::new(),
            thresholds: Vec::new(),
            workers: WorkerStats::default(),
            throughput: Throughput::default(),
            setup_error: None,
            teardown_errors: Vec::new(),
        };

        let v: Value = match serde_json::to_value(JsonSummaryLine {
            kind: "summary",
            report: &report,
        }) {
            Ok(v) => v,
            Err(err) => panic!("to_value failed: {err}"),
        };

        assert_eq!(v.get("kind").and_then(Value::as_str), Some("summary"));
        assert_eq!(v.get("stop_reason").and_then(Value::as_str), Some("completed"));
        assert_eq!(v.get("exit_code").and_then(Value::as_i64), Some(0));
        assert_eq!(v.get("seed").and_then(Value::as_u64), Some(7));
        assert!(v.get("setup_error").is_none());
    }
}
