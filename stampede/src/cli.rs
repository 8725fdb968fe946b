use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    let d = humantime::parse_duration(input.trim())
        .map_err(|e| format!("invalid duration '{input}' (expected e.g. 10s, 250ms, 1m): {e}"))?;
    if d.is_zero() {
        return Err(format!("duration '{input}' must be positive"));
    }
    Ok(d)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress bar and a human-readable summary.
    HumanReadable,
    /// Emit JSON progress lines and a summary line (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "stampede",
    author,
    version,
    about = "Staged, concurrent synthetic-load generator",
    long_about = "stampede drives a pool of virtual users against an HTTP/WebSocket service.\n\nA YAML run file defines the target, the stage plan (ramp/sustain), the weighted scenarios, setup/teardown hooks and the pass/fail thresholds.",
    after_help = "Examples:\n  stampede init\n  stampede run stampede.yaml\n  stampede run stampede.yaml --target http://staging:8000 --output json\n  stampede run stampede.yaml --vus 20 --duration 1m --summary-out results/summary.json"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test
    #[command(
        long_about = "Run the stage plan of a run file against its target.\n\nCLI flags override values from the file."
    )]
    Run(RunArgs),

    /// Write a sample run file
    Init(InitArgs),
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Run file to create
    #[arg(default_value = "stampede.yaml")]
    pub path: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the run file (.yaml)
    pub config: PathBuf,

    /// Base URL of the system under test (overrides `target`)
    #[arg(long, env = "STAMPEDE_TARGET")]
    pub target: Option<String>,

    /// Replace the stage plan with one sustained stage of this many virtual users
    #[arg(long, requires = "duration")]
    pub vus: Option<u64>,

    /// Length of the sustained stage (e.g. 10s, 250ms, 1m)
    #[arg(long, value_parser = parse_duration, requires = "vus")]
    pub duration: Option<Duration>,

    /// Run seed for reproducible scenario selection and pacing
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,

    /// Also write the full report as JSON to this path
    #[arg(long, value_name = "PATH")]
    pub summary_out: Option<PathBuf>,

    /// Log filter (e.g. warn, info, stampede_core=debug). Defaults to RUST_LOG, then `warn`.
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_common_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("1m"), Ok(Duration::from_secs(60)));
        assert_eq!(parse_duration("1h 30m"), Ok(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn cli_parses_run_overrides() {
        let parsed = Cli::try_parse_from([
            "stampede",
            "run",
            "stampede.yaml",
            "--target",
            "http://localhost:8000",
            "--vus",
            "20",
            "--duration",
            "30s",
            "--seed",
            "7",
            "--output",
            "json",
            "--summary-out",
            "out/summary.json",
        ]);

        let cli = match parsed {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };

        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.config, PathBuf::from("stampede.yaml"));
                assert_eq!(args.target.as_deref(), Some("http://localhost:8000"));
                assert_eq!(args.vus, Some(20));
                assert_eq!(args.duration, Some(Duration::from_secs(30)));
                assert_eq!(args.seed, Some(7));
                assert_eq!(args.output, OutputFormat::Json);
                assert_eq!(args.summary_out, Some(PathBuf::from("out/summary.json")));
            }
            Command::Init(_) => panic!("expected run command"),
        }
    }

    #[test]
    fn vus_requires_duration() {
        let parsed = Cli::try_parse_from(["stampede", "run", "stampede.yaml", "--vus", "5"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn cli_parses_init_defaults() {
        let cli = match Cli::try_parse_from(["stampede", "init"]) {
            Ok(v) => v,
            Err(err) => panic!("failed to parse args: {err}"),
        };

        match cli.command {
            Command::Init(args) => {
                assert_eq!(args.path, PathBuf::from("stampede.yaml"));
                assert!(!args.force);
            }
            Command::Run(_) => panic!("expected init command"),
        }
    }
}
