use anyhow::Context as _;
use std::path::Path;

use crate::cli::InitArgs;

pub(crate) const SAMPLE_RUN_FILE: &str = r##"# stampede run file
#
# Run with: stampede run stampede.yaml
# Override the target with --target or STAMPEDE_TARGET.

target: http://localhost:8000

# Virtual users follow the stage plan: `ramp` interpolates from the previous
# target, `sustain` holds its target for the whole stage.
stages:
  - { duration: 30s, target: 20 }
  - { duration: 1m, target: 50 }
  - { duration: 2m, target: 50, kind: sustain }
  - { duration: 30s, target: 100 }
  - { duration: 30s, target: 10 }

# Think time between executions, per virtual user.
pacing:
  mode: uniform
  min: 1s
  max: 3s

# Absent `setup` means a plain TCP reachability check.
setup:
  - health: { path: /health }
  - login:
      path: /auth/login
      body: { username: loadtest@example.com, password: loadtest }
      allow_anonymous: true

scenarios:
  - name: health
    weight: 10
    http:
      path: /health

  - name: list_tasks
    weight: 40
    http:
      path: /api/v1/tasks?skip=0&limit=20
      auth: bearer
      # Either a bare array or a paginated `{ items: [...] }` page.
      expect:
        any_of:
          - { json_array: "" }
          - { json_array: items }

  # Creates a task, then reads it back using the id from the response.
  - name: create_task
    weight: 30
    http:
      method: POST
      path: /api/v1/tasks
      auth: bearer
      body:
        titulo: "${pick:Patrullaje Zona Norte|Revision de Seguridad|Operativo Rutinario}"
        descripcion: "Tarea generada por stampede (vu ${vu}, iter ${iter})"
        prioridad: "${pick:baja|media|alta}"
        estado: pendiente
      expect_status: [200, 201]
      expect: { json_field: id }
      capture: { task_id: id }
      then:
        - path: /api/v1/tasks/${task_id}
          auth: bearer
          expect: { json_field: titulo }

  - name: metrics
    weight: 10
    http:
      path: /metrics
      expect:
        any_of:
          - { contains: "# HELP" }
          - { contains: "# TYPE" }

  # Persistent connections held for 30-90s each.
  # - name: websocket
  #   weight: 10
  #   websocket:
  #     path: /ws/connect?user_id=loadtest_user_${vu}&user_role=${pick:admin|operator|viewer}
  #     hold: { min: 30s, max: 90s }
  #     farewell: '{"type":"ping"}'
  #     # Records message delivery delay from the send time servers stamp on each message.
  #     latency_field: timestamp

thresholds:
  latency: ["p(95)<500", "p(99)<1000"]
  error_rate:
    - expression: rate<0.05
      abort_on_fail: true
      abort_grace: 30s
      description: error budget
"##;

pub async fn init(args: InitArgs) -> anyhow::Result<()> {
    write_file(&args.path, SAMPLE_RUN_FILE, args.force).await?;
    println!("wrote {}", args.path.display());
    Ok(())
}

async fn write_file(path: &Path, contents: &str, force: bool) -> anyhow::Result<()> {
    if !force
        && tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("failed to check file existence: {}", path.display()))?
    {
        anyhow::bail!(
            "refusing to overwrite existing file (use --force): {}",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create dir: {}", parent.display()))?;
    }

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write file: {}", path.display()))
}
