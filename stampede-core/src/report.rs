use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Serialize, Serializer};
use stampede_metrics::MetricSnapshot;

use crate::exit_code::ExitCode;
use crate::stage::StageKind;
use crate::thresholds::ThresholdResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// The stage plan ran to its end.
    Completed,
    ThresholdAbort,
    Interrupted,
    SetupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReached {
    /// 1-based.
    pub stage: usize,
    pub stages: usize,
    pub kind: StageKind,
    pub target: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub spawned: u64,
    pub retired: u64,
    pub peak_live: u64,
    /// Workers that did not stop within the teardown timeout.
    pub force_aborted: u64,
    pub panicked: u64,
    /// Scenario executions started across all workers.
    pub executions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Throughput {
    pub rps_mean: f64,
    pub rps_stdev: f64,
    pub rps_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<String>,
    /// All thresholds passed and no fatal error occurred.
    pub passed: bool,
    pub exit_code: ExitCode,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub stage_reached: Option<StageReached>,
    pub seed: u64,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub thresholds: Vec<ThresholdResult>,
    pub workers: WorkerStats,
    pub throughput: Throughput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
}

impl RunReport {
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    pub(crate) fn exit_code_for(stop_reason: StopReason, thresholds_passed: bool) -> ExitCode {
        match stop_reason {
            StopReason::SetupFailed => ExitCode::SetupFailed,
            StopReason::Interrupted => ExitCode::Interrupted,
            StopReason::ThresholdAbort => ExitCode::ThresholdAbort,
            StopReason::Completed if thresholds_passed => ExitCode::Success,
            StopReason::Completed => ExitCode::ThresholdsFailed,
        }
    }
}

fn serialize_secs<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_stop_reason() {
        assert_eq!(
            RunReport::exit_code_for(StopReason::Completed, true),
            ExitCode::Success
        );
        assert_eq!(
            RunReport::exit_code_for(StopReason::Completed, false),
            ExitCode::ThresholdsFailed
        );
        assert_eq!(
            RunReport::exit_code_for(StopReason::ThresholdAbort, false),
            ExitCode::ThresholdAbort
        );
        assert_eq!(
            RunReport::exit_code_for(StopReason::Interrupted, true),
            ExitCode::Interrupted
        );
        assert_eq!(
            RunReport::exit_code_for(StopReason::SetupFailed, true),
            ExitCode::SetupFailed
        );
    }
}
