use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::Context as _;
use stampede_testserver::TestServer;

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn config(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/configs")
        .join(name)
}

fn ensure_code(out: &Output, expected: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        status_code(out.status) == expected,
        "expected exit code {expected}, got {}\nstdout:\n{}\nstderr:\n{}",
        status_code(out.status),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

async fn run_stampede(args: Vec<String>) -> anyhow::Result<Output> {
    let exe = env!("CARGO_BIN_EXE_stampede");
    tokio::task::spawn_blocking(move || {
        Command::new(exe)
            .args(&args)
            .env_remove("STAMPEDE_TARGET")
            .output()
    })
    .await
    .context("spawn_blocking join")?
    .context("run stampede binary")
}

fn run_args(config_name: &str, target: &str, extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        config(config_name).display().to_string(),
        "--target".to_string(),
        target.to_string(),
    ];
    args.extend(extra.iter().map(|s| (*s).to_string()));
    args
}

#[test]
fn invalid_flags_exit_30() -> anyhow::Result<()> {
    let exe = env!("CARGO_BIN_EXE_stampede");

    let out = Command::new(exe)
        .arg("run")
        .arg("./does-not-matter.yaml")
        .arg("--vus")
        .arg("2")
        .arg("--duration")
        .arg("10x")
        .output()
        .context("run stampede binary")?;

    ensure_code(&out, 30)
}

#[tokio::test]
async fn missing_run_file_exits_30() -> anyhow::Result<()> {
    let out = run_stampede(run_args("does-not-exist.yaml", "http://127.0.0.1:9", &[])).await?;
    ensure_code(&out, 30)?;
    anyhow::ensure!(
        String::from_utf8_lossy(&out.stderr).contains("failed to read run file"),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

#[tokio::test]
async fn invalid_threshold_exits_30() -> anyhow::Result<()> {
    let out = run_stampede(run_args("invalid.yaml", "http://127.0.0.1:9", &[])).await?;
    ensure_code(&out, 30)
}

#[tokio::test]
async fn passing_run_exits_0() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let out = run_stampede(run_args("ok.yaml", server.base_url(), &[])).await?;
    let served = server.stats().requests_total();
    server.shutdown().await;

    ensure_code(&out, 0)?;
    anyhow::ensure!(served > 0, "no requests reached the server");
    let stdout = String::from_utf8_lossy(&out.stdout);
    anyhow::ensure!(stdout.contains("result: passed"), "stdout:\n{stdout}");
    Ok(())
}

#[tokio::test]
async fn thresholds_failed_exit_11() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let out = run_stampede(run_args("thresholds_fail.yaml", server.base_url(), &[])).await?;
    server.shutdown().await;

    ensure_code(&out, 11)
}

#[tokio::test]
async fn threshold_abort_exits_12_early() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let started = std::time::Instant::now();
    let out = run_stampede(run_args(
        "threshold_abort.yaml",
        server.base_url(),
        &["--output", "json"],
    ))
    .await?;
    let took = started.elapsed();
    server.shutdown().await;

    ensure_code(&out, 12)?;
    anyhow::ensure!(
        took < std::time::Duration::from_secs(20),
        "abort took {took:?}"
    );
    Ok(())
}

#[tokio::test]
async fn unreachable_target_exits_20() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let out = run_stampede(run_args("ok.yaml", &format!("http://{addr}"), &[])).await?;
    ensure_code(&out, 20)?;
    anyhow::ensure!(
        String::from_utf8_lossy(&out.stderr).contains("setup failed"),
        "stderr:\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(())
}

#[tokio::test]
async fn json_output_and_summary_file() -> anyhow::Result<()> {
    let server = TestServer::start().await.context("start test server")?;
    let dir = tempfile::tempdir()?;
    let summary = dir.path().join("results").join("summary.json");
    let summary_arg = summary.display().to_string();

    let out = run_stampede(run_args(
        "ok.yaml",
        server.base_url(),
        &[
            "--output",
            "json",
            "--vus",
            "1",
            "--duration",
            "1s",
            "--seed",
            "7",
            "--summary-out",
            &summary_arg,
        ],
    ))
    .await?;
    server.shutdown().await;
    ensure_code(&out, 0)?;

    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()
        .with_context(|| format!("stdout is not NDJSON:\n{stdout}"))?;
    let last = lines.last().context("no output lines")?;
    assert_eq!(last.get("kind").and_then(|v| v.as_str()), Some("summary"));
    assert!(
        lines[..lines.len() - 1]
            .iter()
            .all(|l| l.get("kind").and_then(|v| v.as_str()) == Some("progress"))
    );

    let written: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&summary).await?)?;
    assert_eq!(written.get("exit_code").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(written.get("seed").and_then(|v| v.as_u64()), Some(7));
    assert!(written.pointer("/metrics/latency/count").is_some());
    Ok(())
}

#[tokio::test]
async fn init_writes_a_runnable_sample() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stampede.yaml");
    let out = run_stampede(vec!["init".to_string(), path.display().to_string()]).await?;
    ensure_code(&out, 0)?;

    let again = run_stampede(vec!["init".to_string(), path.display().to_string()]).await?;
    ensure_code(&again, 40)
}

#[tokio::test]
async fn sample_run_file_passes_against_the_test_server() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stampede.yaml");
    ensure_code(
        &run_stampede(vec!["init".to_string(), path.display().to_string()]).await?,
        0,
    )?;

    let server = TestServer::start().await.context("start test server")?;
    let out = run_stampede(vec![
        "run".to_string(),
        path.display().to_string(),
        "--target".to_string(),
        server.base_url().to_string(),
        "--vus".to_string(),
        "2".to_string(),
        "--duration".to_string(),
        "3s".to_string(),
        "--seed".to_string(),
        "5".to_string(),
    ])
    .await?;
    let logins_failed = server.stats().logins_failed();
    let bearer = server.stats().bearer_requests();
    server.shutdown().await;

    ensure_code(&out, 0)?;
    assert_eq!(logins_failed, 0);
    anyhow::ensure!(bearer > 0, "the login token was never used");
    Ok(())
}
