use std::path::Path;
use std::sync::Arc;

mod format;
mod progress;
mod summary;

use format::{format_duration, format_ms_opt, format_percent, format_rate};
use progress::HumanProgress;
use summary::render;

use super::OutputFormatter;
use crate::config::RunPlan;

pub(crate) struct HumanReadableOutput {
    progress: Arc<HumanProgress>,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: Arc::new(HumanProgress::new()),
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, config_path: &Path, plan: &RunPlan) {
        let stages = &plan.config.stages;
        let total: std::time::Duration = stages.iter().map(|s| s.duration).sum();
        let peak = stages
            .iter()
            .map(|s| s.target)
            .chain([plan.config.start])
            .max()
            .unwrap_or_default();

        println!("run file: {}", config_path.display());
        println!("target: {}", plan.target);
        println!(
            "stages: {} over {} (peak {peak} VUs)",
            stages.len(),
            format_duration(total)
        );

        let total_weight: f64 = plan.scenario_info.iter().map(|s| s.weight).sum();
        for s in &plan.scenario_info {
            let share = if total_weight > 0.0 {
                s.weight / total_weight
            } else {
                0.0
            };
            println!(
                "scenario: {} {} weight={} ({})",
                s.name,
                s.kind,
                s.weight,
                format_percent(share)
            );
        }
        println!();
    }

    fn progress(&self) -> Option<stampede_core::ProgressFn> {
        let progress = self.progress.clone();

        Some(Arc::new(move |u| {
            let stage = &u.stage;
            let prefix = format!("stage {}/{} {}", stage.stage, stage.stages, stage.kind);
            let message = format!(
                "target={} vus={} rps={} errors={} p95={} elapsed={} stage_remaining={}",
                stage.current_target,
                u.live_workers,
                format_rate(u.rps_now),
                format_percent(u.error_rate_now),
                format_ms_opt(u.latency_p95_ms),
                format_duration(u.elapsed),
                format_duration(stage.stage_remaining),
            );
            progress.update(u.total_duration, u.elapsed, prefix, message);
        }))
    }

    fn print_summary(&self, report: &stampede_core::RunReport) -> anyhow::Result<()> {
        self.progress.finish();
        print!("{}", render(report));

        if let Some(err) = &report.setup_error {
            eprintln!("setup failed: {err}");
        }
        for err in &report.teardown_errors {
            eprintln!("teardown: {err}");
        }

        let failed: Vec<_> = report.thresholds.iter().filter(|t| !t.passed).collect();
        if !failed.is_empty() {
            eprintln!("thresholds failed:");
            for t in failed {
                match t.observed {
                    Some(obs) => eprintln!("  {}: {} (observed {obs})", t.metric, t.expression),
                    None => eprintln!("  {}: {} (missing series)", t.metric, t.expression),
                }
            }
        }

        Ok(())
    }
}
