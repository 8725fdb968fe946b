use anyhow::Context as _;
use std::path::Path;

use stampede_core::{ExitCode, LoadGenerator, RunReport};

use crate::cli::RunArgs;
use crate::config::{self, Overrides};
use crate::logging;
use crate::output;
use crate::run_error::RunError;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    logging::init(args.log_level.as_deref()).map_err(RunError::InvalidInput)?;

    let out = output::formatter(args.output);

    let file = config::load(&args.config)
        .await
        .map_err(RunError::InvalidInput)?;
    let overrides = Overrides {
        target: args.target.clone(),
        vus: args.vus,
        duration: args.duration,
        seed: args.seed,
    };
    let plan = file
        .into_plan(&overrides)
        .with_context(|| format!("invalid run file: {}", args.config.display()))
        .map_err(RunError::InvalidInput)?;

    out.print_header(&args.config, &plan);

    let mut generator = LoadGenerator::new(plan.config, plan.scenarios)
        .context("invalid run configuration")
        .map_err(RunError::InvalidInput)?
        .with_setup(plan.setup)
        .with_teardown(plan.teardown);
    if let Some(progress) = out.progress() {
        generator = generator.with_progress(progress);
    }

    let stop = generator.stop_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping the run");
            stop.stop();
        }
    });

    tracing::info!(target = %plan.target, "starting run");
    let report = generator.run().await;
    ctrl_c.abort();

    out.print_summary(&report).map_err(RunError::RuntimeError)?;

    if let Some(path) = &args.summary_out {
        write_summary(path, &report)
            .await
            .map_err(RunError::RuntimeError)?;
    }

    Ok(report.exit_code)
}

async fn write_summary(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report).context("failed to serialize the report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("failed to create summary output dir: {}", parent.display())
        })?;
    }
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write summary: {}", path.display()))
}
