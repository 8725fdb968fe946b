use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use stampede_metrics::{HistogramConfig, Registry, RunningStats, is_plain_tag, per_sec};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, LATENCY};
use crate::error::{ConfigError, SetupFailure};
use crate::hooks::HookChain;
use crate::pacing::{Backoff, Pacing};
use crate::progress::{ProgressFn, ProgressUpdate, StageProgress};
use crate::registry::ScenarioRegistry;
use crate::report::{RunReport, StageReached, StopReason, Throughput, WorkerStats};
use crate::scenario::RunData;
use crate::schedule::{StageSchedule, StageSnapshot};
use crate::stage::Stage;
use crate::thresholds::{self, ThresholdSpec};
use crate::vu::{VirtualUser, VuShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    SettingUp,
    Running,
    TearingDown,
    Reported,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Target before the first stage.
    pub start: u64,
    pub stages: Vec<Stage>,
    pub thresholds: Vec<ThresholdSpec>,
    pub pacing: Pacing,
    pub backoff: Backoff,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub setup_timeout: Duration,
    pub teardown_timeout: Duration,
    /// Run seed; per-worker seeds derive from it. Random when unset.
    pub seed: Option<u64>,
    pub histogram: HistogramConfig,
    /// Outcome tag keys that get their own latency series.
    pub breakdown: Vec<String>,
}

impl GeneratorConfig {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            start: 0,
            stages,
            thresholds: Vec::new(),
            pacing: Pacing::default(),
            backoff: Backoff::default(),
            poll_interval: Duration::from_millis(100),
            progress_interval: Duration::from_secs(1),
            setup_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(10),
            seed: None,
            histogram: HistogramConfig::default(),
            breakdown: Vec::new(),
        }
    }
}

/// Requests a graceful stop of a running generator.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

struct Driven {
    stop_reason: StopReason,
    aborted_by: Option<String>,
    elapsed: Duration,
    stage: StageSnapshot,
    workers: WorkerStats,
    throughput: Throughput,
}

pub struct LoadGenerator {
    config: GeneratorConfig,
    schedule: StageSchedule,
    scenarios: Arc<ScenarioRegistry>,
    setup: HookChain,
    teardown: HookChain,
    aggregator: Arc<Aggregator>,
    state: watch::Sender<RunState>,
    stop: CancellationToken,
    progress: Option<ProgressFn>,
}

impl LoadGenerator {
    pub fn new(config: GeneratorConfig, scenarios: ScenarioRegistry) -> Result<Self, ConfigError> {
        let schedule = StageSchedule::new(config.start, config.stages.clone())?;
        config.pacing.validate()?;
        if let Some(key) = config.breakdown.iter().find(|k| !is_plain_tag(k)) {
            return Err(ConfigError::InvalidBreakdownKey(key.clone()));
        }
        for (name, d) in [
            ("poll_interval", config.poll_interval),
            ("progress_interval", config.progress_interval),
            ("setup_timeout", config.setup_timeout),
            ("teardown_timeout", config.teardown_timeout),
        ] {
            if d.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        let registry = Registry::new(config.histogram)?;
        let aggregator = Arc::new(Aggregator::new(registry, config.breakdown.clone()));
        let (state, _) = watch::channel(RunState::Idle);

        Ok(Self {
            config,
            schedule,
            scenarios: Arc::new(scenarios),
            setup: HookChain::default(),
            teardown: HookChain::default(),
            aggregator,
            state,
            stop: CancellationToken::new(),
            progress: None,
        })
    }

    #[must_use]
    pub fn with_setup(mut self, setup: HookChain) -> Self {
        self.setup = setup;
        self
    }

    #[must_use]
    pub fn with_teardown(mut self, teardown: HookChain) -> Self {
        self.teardown = teardown;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    pub fn schedule(&self) -> &StageSchedule {
        &self.schedule
    }

    /// Runs setup, the staged load and teardown. Always produces a report.
    pub async fn run(self) -> RunReport {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let run_started = Instant::now();

        self.set_state(RunState::SettingUp);
        let mut data = RunData::default();
        let setup = if self.setup.is_empty() {
            Some(Ok(()))
        } else {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => None,
                r = tokio::time::timeout(self.config.setup_timeout, self.setup.run(&mut data)) => {
                    Some(r.unwrap_or(Err(SetupFailure::Timeout(self.config.setup_timeout))))
                }
            }
        };

        match setup {
            Some(Ok(())) => {}
            Some(Err(failure)) => {
                tracing::error!(error = %failure, "setup failed");
                return self.finish_without_load(
                    StopReason::SetupFailed,
                    Some(failure.to_string()),
                    seed,
                    run_started.elapsed(),
                );
            }
            None => {
                tracing::warn!("stopped during setup");
                return self.finish_without_load(
                    StopReason::Interrupted,
                    None,
                    seed,
                    run_started.elapsed(),
                );
            }
        }

        let data = Arc::new(data);
        let driven = self.drive(data.clone(), seed).await;

        let mut teardown_errors = Vec::new();
        if !self.teardown.is_empty() {
            let mut data = (*data).clone();
            match tokio::time::timeout(self.config.teardown_timeout, self.teardown.run(&mut data))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "teardown failed");
                    teardown_errors.push(err.to_string());
                }
                Err(_) => {
                    let err = format!(
                        "teardown did not finish within {:?}",
                        self.config.teardown_timeout
                    );
                    tracing::warn!("{err}");
                    teardown_errors.push(err);
                }
            }
        }

        let results = thresholds::evaluate(&self.config.thresholds, &*self.aggregator);
        let exit_code =
            RunReport::exit_code_for(driven.stop_reason, thresholds::all_passed(&results));

        let report = RunReport {
            stop_reason: driven.stop_reason,
            aborted_by: driven.aborted_by,
            passed: exit_code == crate::ExitCode::Success,
            exit_code,
            elapsed: driven.elapsed,
            stage_reached: Some(StageReached {
                stage: driven.stage.index + 1,
                stages: driven.stage.count,
                kind: driven.stage.kind,
                target: driven.stage.current_target,
            }),
            seed,
            metrics: self.aggregator.snapshot_all(),
            thresholds: results,
            workers: driven.workers,
            throughput: driven.throughput,
            setup_error: None,
            teardown_errors,
        };

        self.set_state(RunState::Reported);
        report
    }

    fn finish_without_load(
        &self,
        stop_reason: StopReason,
        setup_error: Option<String>,
        seed: u64,
        elapsed: Duration,
    ) -> RunReport {
        let results = thresholds::evaluate(&self.config.thresholds, &*self.aggregator);
        let exit_code = RunReport::exit_code_for(stop_reason, thresholds::all_passed(&results));

        let report = RunReport {
            stop_reason,
            aborted_by: None,
            passed: false,
            exit_code,
            elapsed,
            stage_reached: None,
            seed,
            metrics: self.aggregator.snapshot_all(),
            thresholds: results,
            workers: WorkerStats::default(),
            throughput: Throughput::default(),
            setup_error,
            teardown_errors: Vec::new(),
        };

        self.set_state(RunState::Reported);
        report
    }

    async fn drive(&self, data: Arc<RunData>, seed: u64) -> Driven {
        let live = Arc::new(AtomicU64::new(0));
        let peak_live = Arc::new(AtomicU64::new(0));
        let shared = Arc::new(VuShared {
            registry: self.scenarios.clone(),
            aggregator: self.aggregator.clone(),
            data,
            pacing: self.config.pacing.clone(),
            backoff: self.config.backoff,
            live: live.clone(),
            peak_live: peak_live.clone(),
            peak: self.schedule.peak(),
        });

        let run_token = CancellationToken::new();
        let mut pool: Vec<Worker> = Vec::new();
        let mut retiring: Vec<JoinHandle<u64>> = Vec::new();
        let mut workers = WorkerStats::default();
        let mut next_id: u64 = 1;

        let abort_specs: Vec<&ThresholdSpec> = self
            .config
            .thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .collect();

        self.set_state(RunState::Running);
        tracing::info!(
            stages = self.schedule.stages().len(),
            duration = ?self.schedule.total_duration(),
            peak = self.schedule.peak(),
            seed,
            "load started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started = Instant::now();
        let mut last_stage: Option<usize> = None;
        let mut tick: u64 = 0;
        let mut last_progress_at = started;
        let mut last_totals = (0u64, 0u64);
        let mut rps = RunningStats::default();

        let (stop_reason, aborted_by) = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break (StopReason::Interrupted, None),
                _ = interval.tick() => {}
            }

            let elapsed = started.elapsed();
            if self.schedule.is_complete(elapsed) {
                break (StopReason::Completed, None);
            }

            reap_finished_pool(&mut pool, &mut workers).await;
            reap_finished(&mut retiring, &mut workers).await;

            let target = self.schedule.target_at(elapsed);
            let current = pool.len() as u64;
            if target > current {
                for _ in current..target {
                    let id = next_id;
                    next_id += 1;
                    let cancel = run_token.child_token();
                    let vu = VirtualUser {
                        id,
                        rng_seed: VirtualUser::seed_for(seed, id),
                        cancel: cancel.clone(),
                    };
                    pool.push(Worker {
                        cancel,
                        handle: tokio::spawn(vu.run(shared.clone())),
                    });
                    workers.spawned += 1;
                }
                tracing::debug!(from = current, to = target, "scaled up");
            } else if target < current {
                for _ in target..current {
                    let Some(worker) = pool.pop() else {
                        break;
                    };
                    worker.cancel.cancel();
                    retiring.push(worker.handle);
                    workers.retired += 1;
                }
                tracing::debug!(from = current, to = target, "scaled down");
            }

            let stage = self.schedule.stage_snapshot_at(elapsed);
            if last_stage != Some(stage.index) {
                tracing::info!(
                    stage = stage.index + 1,
                    stages = stage.count,
                    kind = %stage.kind,
                    from = stage.start_target,
                    to = stage.end_target,
                    "entering stage"
                );
                last_stage = Some(stage.index);
            }

            if let Some(failed) = self.failed_abort_threshold(&abort_specs, elapsed) {
                tracing::warn!(threshold = %failed, "abort threshold failed; stopping run");
                break (StopReason::ThresholdAbort, Some(failed));
            }

            let now = Instant::now();
            let dt = now.duration_since(last_progress_at);
            if dt >= self.config.progress_interval {
                last_progress_at = now;
                tick += 1;

                let totals = self.aggregator.totals();
                let delta_total = totals.0.saturating_sub(last_totals.0);
                let delta_failed = totals.1.saturating_sub(last_totals.1);
                last_totals = totals;

                let rps_now = per_sec(delta_total, dt.as_secs_f64());
                rps.push(rps_now);

                if let Some(progress) = &self.progress {
                    let latency = self.aggregator.snapshot(LATENCY);
                    (progress)(ProgressUpdate {
                        tick,
                        state: RunState::Running,
                        elapsed,
                        total_duration: self.schedule.total_duration(),
                        stage: stage_progress(&stage),
                        live_workers: live.load(Ordering::Relaxed),
                        outcomes_total: totals.0,
                        failures_total: totals.1,
                        rps_now,
                        error_rate_now: if delta_total == 0 {
                            0.0
                        } else {
                            delta_failed as f64 / delta_total as f64
                        },
                        latency_p50_ms: latency.as_ref().and_then(|l| l.p50),
                        latency_p95_ms: latency.as_ref().and_then(|l| l.p95),
                    });
                }
            }
        };

        let elapsed = started.elapsed();
        let stage = self.schedule.stage_snapshot_at(elapsed);
        tracing::info!(reason = %stop_reason, ?elapsed, "load stopped");

        self.set_state(RunState::TearingDown);
        run_token.cancel();

        let deadline = Instant::now() + self.config.teardown_timeout;
        let handles = pool
            .into_iter()
            .map(|w| w.handle)
            .chain(retiring)
            .collect::<Vec<_>>();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(r) => collect(r, &mut workers),
                Err(_) => {
                    handle.abort();
                    workers.force_aborted += 1;
                }
            }
        }
        if workers.force_aborted > 0 {
            tracing::warn!(
                count = workers.force_aborted,
                timeout = ?self.config.teardown_timeout,
                "workers did not stop in time and were aborted"
            );
        }
        workers.peak_live = peak_live.load(Ordering::Relaxed);

        Driven {
            stop_reason,
            aborted_by,
            elapsed,
            stage,
            workers,
            throughput: Throughput {
                rps_mean: rps.mean(),
                rps_stdev: rps.stdev(),
                rps_max: rps.max(),
            },
        }
    }

    /// First failing abort-on-fail threshold past its grace period. Thresholds whose metric
    /// has no value yet do not abort.
    fn failed_abort_threshold(&self, specs: &[&ThresholdSpec], elapsed: Duration) -> Option<String> {
        let due: Vec<&ThresholdSpec> = specs
            .iter()
            .copied()
            .filter(|s| elapsed >= s.abort_grace)
            .collect();
        if due.is_empty() {
            return None;
        }

        thresholds::evaluate(due, &*self.aggregator)
            .into_iter()
            .find(|r| !r.passed && r.observed.is_some())
            .map(|r| format!("{}: {}", r.metric, r.expression))
    }

    fn set_state(&self, state: RunState) {
        tracing::info!(%state, "run state");
        self.state.send_replace(state);
    }
}

fn stage_progress(s: &StageSnapshot) -> StageProgress {
    StageProgress {
        stage: s.index + 1,
        stages: s.count,
        kind: s.kind,
        stage_elapsed: s.stage_elapsed,
        stage_remaining: s.stage_remaining,
        start_target: s.start_target,
        end_target: s.end_target,
        current_target: s.current_target,
    }
}

async fn reap_finished(handles: &mut Vec<JoinHandle<u64>>, stats: &mut WorkerStats) {
    let mut i = 0;
    while i < handles.len() {
        if handles[i].is_finished() {
            let handle = handles.swap_remove(i);
            collect(handle.await, stats);
        } else {
            i += 1;
        }
    }
}

/// Pool workers only finish on their own by panicking; the next scale step replaces them.
async fn reap_finished_pool(pool: &mut Vec<Worker>, stats: &mut WorkerStats) {
    let mut i = 0;
    while i < pool.len() {
        if pool[i].handle.is_finished() {
            let worker = pool.remove(i);
            collect(worker.handle.await, stats);
        } else {
            i += 1;
        }
    }
}

fn collect(result: Result<u64, JoinError>, stats: &mut WorkerStats) {
    match result {
        Ok(executions) => stats.executions += executions,
        Err(err) if err.is_panic() => {
            tracing::error!(error = %err, "worker panicked");
            stats.panicked += 1;
        }
        Err(_) => {}
    }
}
