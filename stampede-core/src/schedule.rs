use std::time::Duration;

use crate::error::ConfigError;
use crate::stage::{Stage, StageKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    /// 0-based.
    pub index: usize,
    pub count: usize,
    pub kind: StageKind,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

/// Maps elapsed run time to a target worker count. Pure; holds no clock.
#[derive(Debug, Clone)]
pub struct StageSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl StageSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }

        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        if acc.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }

        Ok(Self {
            start,
            stages,
            cumulative_ends,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// True once `elapsed` is strictly past the end of the last stage.
    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed > self.total_duration()
    }

    /// Largest target of the plan, including the start value.
    pub fn peak(&self) -> u64 {
        self.stages
            .iter()
            .map(|s| s.target)
            .max()
            .unwrap_or(0)
            .max(self.start)
    }

    pub fn target_at(&self, elapsed: Duration) -> u64 {
        if self.is_complete(elapsed) {
            return 0;
        }

        let idx = self.stage_index(elapsed);
        let (stage_start, stage_end) = self.bounds(idx);
        let stage = &self.stages[idx];
        let start_target = self.start_target(idx);
        let end_target = stage.target;

        let stage_duration = stage_end.saturating_sub(stage_start);
        if stage.kind == StageKind::Sustain || stage_duration.is_zero() {
            return end_target;
        }

        let stage_elapsed = elapsed.saturating_sub(stage_start).min(stage_duration);

        let start_i = start_target as i128;
        let delta = end_target as i128 - start_i;
        let num = stage_elapsed.as_nanos() as i128;
        let den = stage_duration.as_nanos() as i128;

        let cur = start_i + (delta.saturating_mul(num) / den.max(1));
        cur.clamp(0, u64::MAX as i128) as u64
    }

    pub fn stage_snapshot_at(&self, elapsed: Duration) -> StageSnapshot {
        let clamped = elapsed.min(self.total_duration());
        let idx = self.stage_index(clamped);
        let (stage_start, stage_end) = self.bounds(idx);

        let stage_duration = stage_end.saturating_sub(stage_start);
        let stage_elapsed = clamped.saturating_sub(stage_start);

        StageSnapshot {
            index: idx,
            count: self.stages.len(),
            kind: self.stages[idx].kind,
            stage_elapsed,
            stage_remaining: stage_duration.saturating_sub(stage_elapsed),
            start_target: self.start_target(idx),
            end_target: self.stages[idx].target,
            current_target: self.target_at(clamped),
        }
    }

    fn stage_index(&self, elapsed: Duration) -> usize {
        let idx = match self
            .cumulative_ends
            .binary_search_by(|end| end.cmp(&elapsed))
        {
            Ok(i) => i,
            Err(i) => i,
        };
        idx.min(self.stages.len() - 1)
    }

    fn bounds(&self, idx: usize) -> (Duration, Duration) {
        let start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };
        (start, self.cumulative_ends[idx])
    }

    fn start_target(&self, idx: usize) -> u64 {
        if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        }
    }
}
