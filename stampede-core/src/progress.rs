use std::time::Duration;

use crate::generator::RunState;
use crate::stage::StageKind;

#[derive(Debug, Clone, PartialEq)]
pub struct StageProgress {
    /// 1-based stage index.
    pub stage: usize,
    pub stages: usize,
    pub kind: StageKind,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    pub state: RunState,
    pub elapsed: Duration,
    pub total_duration: Duration,
    pub stage: StageProgress,
    /// Workers currently running their loop.
    pub live_workers: u64,
    pub outcomes_total: u64,
    pub failures_total: u64,
    /// Outcomes/sec observed during the last tick.
    pub rps_now: f64,
    /// Failed / total outcomes during the last tick (0..=1).
    pub error_rate_now: f64,
    /// Run-wide latency percentiles so far, milliseconds.
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
}

pub type ProgressFn = std::sync::Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;
