mod aggregator;
mod error;
mod exit_code;
mod generator;
mod hooks;
mod pacing;
mod progress;
mod registry;
mod report;
mod scenario;
mod schedule;
mod session;
mod stage;
mod thresholds;
mod vu;

pub use aggregator::{
    Aggregator, ERROR_RATE, ERRORS, LATENCY, MESSAGE_LATENCY, SESSION_DURATION, SESSION_MESSAGES,
};
pub use error::{ConfigError, SetupFailure};
pub use exit_code::ExitCode;
pub use generator::{GeneratorConfig, LoadGenerator, RunState, StopHandle};
pub use hooks::{Hook, HookChain};
pub use pacing::{Backoff, Pacing};
pub use progress::{ProgressFn, ProgressUpdate, StageProgress};
pub use registry::{ScenarioRegistry, ScenarioRegistryBuilder};
pub use report::{RunReport, StageReached, StopReason, Throughput, WorkerStats};
pub use scenario::{
    CloseReason, ErrorKind, Outcome, RequestScenario, RunData, ScenarioContext, ScenarioExec,
    ScenarioFailure, ScenarioSpec, Session, SessionEvent, SessionLimits, SessionScenario,
    SessionStats, Tags,
};
pub use schedule::{StageSchedule, StageSnapshot};
pub use stage::{Stage, StageKind};
pub use thresholds::{
    SnapshotProvider, ThresholdAgg, ThresholdExpr, ThresholdOp, ThresholdParseError,
    ThresholdResult, ThresholdSpec, all_passed, evaluate as evaluate_thresholds,
};
pub use vu::VirtualUser;

pub use stampede_metrics::{HistogramConfig, MetricSnapshot, split_metric_name};
