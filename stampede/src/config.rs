use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use stampede_core::{
    Backoff, GeneratorConfig, HistogramConfig, HookChain, Pacing, ScenarioRegistry, ScenarioSpec,
    Stage, StageKind, ThresholdSpec,
};
use stampede_http::{
    AckMatcher, Auth, BodyCheck, HealthHook, HttpClient, HttpScenario, HttpStep, LoginHook,
    ReachabilityHook, Template, WsScenario, join_url,
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|v| YamlDuration(Duration::from_secs(v)))
                    .map_err(|_| E::custom("duration cannot be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Ok(YamlDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}

fn secs(v: u64) -> YamlDuration {
    YamlDuration(Duration::from_secs(v))
}

fn millis(v: u64) -> YamlDuration {
    YamlDuration(Duration::from_millis(v))
}

fn default_weight() -> f64 {
    1.0
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_statuses() -> Vec<u16> {
    vec![200]
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

fn default_token_field() -> String {
    "access_token".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RunFile {
    pub target: Option<String>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub start_vus: u64,
    #[serde(default)]
    pub stages: Vec<StageYaml>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioYaml>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdsYaml>,
    pub pacing: Option<PacingYaml>,
    /// Absent: a reachability check only. `[]`: no setup at all.
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub setup: Option<Vec<HookYaml>>,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub teardown: Vec<HookYaml>,
    pub poll_interval: Option<YamlDuration>,
    pub progress_interval: Option<YamlDuration>,
    pub setup_timeout: Option<YamlDuration>,
    pub teardown_timeout: Option<YamlDuration>,
    pub request_timeout: Option<YamlDuration>,
    pub connect_timeout: Option<YamlDuration>,
    pub backoff: Option<BackoffYaml>,
    #[serde(default)]
    pub metrics: MetricsYaml,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StageYaml {
    pub duration: YamlDuration,
    pub target: u64,
    #[serde(default)]
    pub kind: StageKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ScenarioYaml {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub timeout: Option<YamlDuration>,
    pub http: Option<HttpYaml>,
    pub websocket: Option<WsYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HttpYaml {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// A string is sent as-is; anything else is sent as JSON.
    pub body: Option<serde_yaml::Value>,
    #[serde(default = "default_statuses")]
    pub expect_status: Vec<u16>,
    #[serde(default)]
    pub expect: ExpectYaml,
    #[serde(default)]
    pub auth: AuthYaml,
    /// Variable name to dotted JSON path, readable as `${name}` by the `then` steps.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
    /// Requests run in order after this one succeeds.
    #[serde(default)]
    pub then: Vec<HttpYaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ExpectYaml {
    pub json_field: Option<String>,
    pub json_array: Option<String>,
    pub contains: Option<String>,
    /// Passes when any one alternative passes.
    #[serde(default)]
    pub any_of: Vec<ExpectYaml>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AuthYaml {
    #[default]
    None,
    Bearer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WsYaml {
    pub path: String,
    pub hold: Option<HoldYaml>,
    pub ack: Option<AckYaml>,
    pub ack_timeout: Option<YamlDuration>,
    pub idle_timeout: Option<YamlDuration>,
    pub linger: Option<YamlDuration>,
    pub close_timeout: Option<YamlDuration>,
    pub farewell: Option<String>,
    /// Dotted path of the send time in server messages.
    pub latency_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HoldYaml {
    pub min: YamlDuration,
    pub max: YamlDuration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AckYaml {
    pub event_field: Option<String>,
    pub event: Option<String>,
    pub require: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub(crate) enum PacingYaml {
    Adaptive {
        base: Option<YamlDuration>,
        min: Option<YamlDuration>,
        max_concurrency: Option<u64>,
    },
    Fixed {
        delay: YamlDuration,
    },
    Uniform {
        min: YamlDuration,
        max: YamlDuration,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BackoffYaml {
    pub base: Option<YamlDuration>,
    pub max: Option<YamlDuration>,
    pub after: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MetricsYaml {
    pub max_value: Option<YamlDuration>,
    pub significant_figures: Option<u8>,
    pub memory_limit_bytes: Option<usize>,
    #[serde(default)]
    pub breakdown: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HookYaml {
    Reachability(ReachabilityYaml),
    Health(HealthYaml),
    Login(LoginYaml),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReachabilityYaml {
    pub timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HealthYaml {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_statuses")]
    pub expect_status: Vec<u16>,
    pub timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginYaml {
    #[serde(default = "default_login_path")]
    pub path: String,
    pub body: serde_yaml::Value,
    #[serde(default = "default_token_field")]
    pub token_field: String,
    #[serde(default)]
    pub allow_anonymous: bool,
    pub timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ThresholdsYaml {
    Many(Vec<ThresholdYaml>),
    One(ThresholdYaml),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ThresholdYaml {
    Expr(String),
    Full {
        expression: String,
        #[serde(default)]
        abort_on_fail: bool,
        abort_grace: Option<YamlDuration>,
        description: Option<String>,
    },
}

/// CLI values that take precedence over the run file.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub target: Option<String>,
    pub vus: Option<u64>,
    pub duration: Option<Duration>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScenarioInfo {
    pub name: String,
    pub weight: f64,
    pub kind: &'static str,
}

/// Everything needed to start a run.
pub(crate) struct RunPlan {
    pub target: String,
    pub config: GeneratorConfig,
    pub scenarios: ScenarioRegistry,
    pub scenario_info: Vec<ScenarioInfo>,
    pub setup: HookChain,
    pub teardown: HookChain,
}

pub(crate) async fn load(path: &Path) -> anyhow::Result<RunFile> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read run file: {}", path.display()))?;
    parse(&text).with_context(|| format!("failed to parse YAML: {}", path.display()))
}

pub(crate) fn parse(text: &str) -> anyhow::Result<RunFile> {
    Ok(serde_yaml::from_str(text)?)
}

impl RunFile {
    pub(crate) fn into_plan(self, overrides: &Overrides) -> anyhow::Result<RunPlan> {
        let target = overrides
            .target
            .clone()
            .or(self.target)
            .context("no target: set `target` in the run file or pass --target")?;
        let target = target.trim_end_matches('/').to_string();
        if !(target.starts_with("http://") || target.starts_with("https://")) {
            anyhow::bail!("target must be an http:// or https:// URL, got `{target}`");
        }

        let stages = match (overrides.vus, overrides.duration) {
            (Some(vus), Some(duration)) => vec![Stage::sustain(duration, vus)],
            _ => self
                .stages
                .iter()
                .map(|s| Stage {
                    duration: s.duration.into_inner(),
                    target: s.target,
                    kind: s.kind,
                })
                .collect(),
        };

        let mut config = GeneratorConfig::new(stages);
        config.start = if overrides.vus.is_some() {
            0
        } else {
            self.start_vus
        };
        config.seed = overrides.seed.or(self.seed);
        if let Some(pacing) = &self.pacing {
            config.pacing = pacing_from_yaml(pacing);
        }
        if let Some(backoff) = &self.backoff {
            let default = Backoff::default();
            config.backoff = Backoff {
                base: backoff.base.map_or(default.base, YamlDuration::into_inner),
                max: backoff.max.map_or(default.max, YamlDuration::into_inner),
                after: backoff.after.unwrap_or(default.after),
            };
        }
        if let Some(d) = self.poll_interval {
            config.poll_interval = d.into_inner();
        }
        if let Some(d) = self.progress_interval {
            config.progress_interval = d.into_inner();
        }
        if let Some(d) = self.setup_timeout {
            config.setup_timeout = d.into_inner();
        }
        if let Some(d) = self.teardown_timeout {
            config.teardown_timeout = d.into_inner();
        }

        let default_hist = HistogramConfig::default();
        config.histogram = HistogramConfig {
            max_value_us: self.metrics.max_value.map_or(default_hist.max_value_us, |d| {
                u64::try_from(d.into_inner().as_micros()).unwrap_or(u64::MAX)
            }),
            significant_figures: self
                .metrics
                .significant_figures
                .unwrap_or(default_hist.significant_figures),
            memory_limit_bytes: self
                .metrics
                .memory_limit_bytes
                .unwrap_or(default_hist.memory_limit_bytes),
        };
        config.breakdown = self.metrics.breakdown.clone();
        config.thresholds = thresholds_from_yaml(&self.thresholds)?;

        let connect_timeout = self.connect_timeout.unwrap_or(secs(3)).into_inner();
        let request_timeout = self
            .request_timeout
            .unwrap_or(YamlDuration(ScenarioSpec::DEFAULT_TIMEOUT))
            .into_inner();
        let client = HttpClient::new(Some(connect_timeout));

        let mut builder = ScenarioRegistry::builder();
        let mut scenario_info = Vec::with_capacity(self.scenarios.len());
        let mut data_keys = BTreeSet::new();
        for scenario in &self.scenarios {
            let (spec, kind) = scenario_from_yaml(scenario, &target, &client, &mut data_keys)
                .with_context(|| format!("invalid scenario `{}`", scenario.name))?;
            let timeout = scenario.timeout.map_or(request_timeout, YamlDuration::into_inner);
            builder.register(spec.with_timeout(timeout))?;
            scenario_info.push(ScenarioInfo {
                name: scenario.name.clone(),
                weight: scenario.weight,
                kind,
            });
        }
        let scenarios = builder.build()?;

        let setup_hooks = match self.setup {
            Some(hooks) => hooks,
            None => vec![HookYaml::Reachability(ReachabilityYaml::default())],
        };
        let provided: BTreeSet<&str> = setup_hooks
            .iter()
            .filter(|h| matches!(h, HookYaml::Login(_)))
            .map(|_| LoginHook::TOKEN_KEY)
            .collect();
        if let Some(missing) = data_keys.iter().find(|k| !provided.contains(k.as_str())) {
            anyhow::bail!("templates read `${{{missing}}}` but no setup hook provides it");
        }
        let setup = hooks_from_yaml(&setup_hooks, &target, &client)?;
        let teardown = hooks_from_yaml(&self.teardown, &target, &client)?;

        Ok(RunPlan {
            target,
            config,
            scenarios,
            scenario_info,
            setup,
            teardown,
        })
    }
}

fn pacing_from_yaml(pacing: &PacingYaml) -> Pacing {
    match pacing {
        PacingYaml::Adaptive {
            base,
            min,
            max_concurrency,
        } => Pacing::Adaptive {
            base: base.unwrap_or(secs(1)).into_inner(),
            min: min.unwrap_or(millis(100)).into_inner(),
            max_concurrency: *max_concurrency,
        },
        PacingYaml::Fixed { delay } => Pacing::Fixed(delay.into_inner()),
        PacingYaml::Uniform { min, max } => Pacing::Uniform {
            min: min.into_inner(),
            max: max.into_inner(),
        },
    }
}

fn thresholds_from_yaml(
    thresholds: &BTreeMap<String, ThresholdsYaml>,
) -> anyhow::Result<Vec<ThresholdSpec>> {
    let mut out = Vec::new();
    for (metric, entries) in thresholds {
        let entries = match entries {
            ThresholdsYaml::Many(v) => v.as_slice(),
            ThresholdsYaml::One(one) => std::slice::from_ref(one),
        };
        for entry in entries {
            let spec = match entry {
                ThresholdYaml::Expr(expression) => ThresholdSpec::new(metric, expression)?,
                ThresholdYaml::Full {
                    expression,
                    abort_on_fail,
                    abort_grace,
                    description,
                } => {
                    let mut spec = ThresholdSpec::new(metric, expression)?;
                    if *abort_on_fail {
                        spec = spec.abort_on_fail(abort_grace.unwrap_or_default().into_inner());
                    }
                    if let Some(d) = description {
                        spec = spec.with_description(d);
                    }
                    spec
                }
            };
            out.push(spec);
        }
    }
    Ok(out)
}

/// Parses a template and notes which run data keys it reads.
fn template(raw: &str, data_keys: &mut BTreeSet<String>) -> anyhow::Result<Template> {
    let t = Template::parse(raw)?;
    data_keys.extend(t.data_keys().map(str::to_string));
    Ok(t)
}

fn ws_base(target: &str) -> String {
    match target.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => target.to_string(),
    }
}

fn checks_from_yaml(expect: &ExpectYaml) -> anyhow::Result<Vec<BodyCheck>> {
    let mut checks = Vec::new();
    if let Some(path) = &expect.json_field {
        checks.push(BodyCheck::JsonField(path.clone()));
    }
    if let Some(path) = &expect.json_array {
        checks.push(BodyCheck::JsonArray(path.clone()));
    }
    if let Some(needle) = &expect.contains {
        checks.push(BodyCheck::Contains(needle.clone()));
    }
    if !expect.any_of.is_empty() {
        let mut alternatives = Vec::with_capacity(expect.any_of.len());
        for alternative in &expect.any_of {
            let mut all = checks_from_yaml(alternative)?;
            alternatives.push(match all.len() {
                0 => anyhow::bail!("every `any_of` alternative needs a check"),
                1 => all.swap_remove(0),
                _ => BodyCheck::AllOf(all),
            });
        }
        checks.push(BodyCheck::AnyOf(alternatives));
    }
    Ok(checks)
}

fn capture_name(name: &str) -> anyhow::Result<()> {
    let word = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !word || matches!(name, "vu" | "iter") {
        anyhow::bail!("`{name}` cannot be a capture name");
    }
    Ok(())
}

/// Builds one request; keys it reads that no earlier step captured must come from setup.
fn http_step(
    h: &HttpYaml,
    target: &str,
    captured: &BTreeSet<String>,
    keys: &mut BTreeSet<String>,
) -> anyhow::Result<HttpStep> {
    let mut reads = BTreeSet::new();
    let method = http::Method::from_bytes(h.method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method `{}`", h.method))?;
    let mut step = HttpStep::new(method, template(&join_url(target, &h.path), &mut reads)?)
        .expect_status(h.expect_status.clone());
    for (name, value) in &h.headers {
        step = step.header(name.clone(), template(value, &mut reads)?);
    }
    if let Some(body) = &h.body {
        let raw = match body {
            serde_yaml::Value::String(text) => text.clone(),
            other => serde_json::to_string(other).context("body is not valid JSON")?,
        };
        step = step.body(template(&raw, &mut reads)?);
    }
    for check in checks_from_yaml(&h.expect)? {
        step = step.check(check);
    }
    if h.auth == AuthYaml::Bearer {
        step = step.auth(Auth::Bearer);
    }
    for (name, path) in &h.capture {
        capture_name(name)?;
        step = step.capture(name.clone(), path.clone());
    }
    keys.extend(reads.into_iter().filter(|k| !captured.contains(k)));
    Ok(step)
}

fn scenario_from_yaml(
    scenario: &ScenarioYaml,
    target: &str,
    client: &HttpClient,
    keys: &mut BTreeSet<String>,
) -> anyhow::Result<(ScenarioSpec, &'static str)> {
    match (&scenario.http, &scenario.websocket) {
        (Some(h), None) => {
            let mut captured = BTreeSet::new();
            let first = http_step(h, target, &captured, keys)?;
            let mut s = HttpScenario::from_step(client.clone(), first);
            captured.extend(h.capture.keys().cloned());
            for (i, next) in h.then.iter().enumerate() {
                if !next.then.is_empty() {
                    anyhow::bail!("`then` steps cannot have their own `then`");
                }
                let step = http_step(next, target, &captured, keys)
                    .with_context(|| format!("invalid `then` step {}", i + 1))?;
                captured.extend(next.capture.keys().cloned());
                s = s.then(step);
            }
            Ok((
                ScenarioSpec::request(&scenario.name, scenario.weight, s),
                "http",
            ))
        }
        (None, Some(w)) => {
            let url = join_url(&ws_base(target), &w.path);
            if url.starts_with("wss://") {
                anyhow::bail!("`{url}`: secure WebSocket (wss://) endpoints are not supported");
            }
            let mut s = WsScenario::new(template(&url, keys)?);
            if let Some(hold) = &w.hold {
                if hold.max.into_inner() < hold.min.into_inner() {
                    anyhow::bail!("`hold.max` is shorter than `hold.min`");
                }
                s = s.hold(hold.min.into_inner(), hold.max.into_inner());
            }
            if let Some(ack) = &w.ack {
                let default = AckMatcher::default();
                s = s.ack(AckMatcher {
                    event_field: ack.event_field.clone().unwrap_or(default.event_field),
                    event: ack.event.clone().unwrap_or(default.event),
                    require: ack.require.clone(),
                });
            }
            if let Some(d) = w.ack_timeout {
                s = s.ack_timeout(d.into_inner());
            }
            if let Some(d) = w.idle_timeout {
                s = s.idle_timeout(d.into_inner());
            }
            if let Some(d) = w.linger {
                s = s.linger(d.into_inner());
            }
            if let Some(d) = w.close_timeout {
                s = s.close_timeout(d.into_inner());
            }
            if let Some(msg) = &w.farewell {
                s = s.farewell(template(msg, keys)?);
            }
            if let Some(path) = &w.latency_field {
                s = s.latency_field(path.clone());
            }
            Ok((
                ScenarioSpec::session(&scenario.name, scenario.weight, s),
                "websocket",
            ))
        }
        (Some(_), Some(_)) => anyhow::bail!("set either `http` or `websocket`, not both"),
        (None, None) => anyhow::bail!("one of `http` or `websocket` is required"),
    }
}

fn hooks_from_yaml(
    hooks: &[HookYaml],
    target: &str,
    client: &HttpClient,
) -> anyhow::Result<HookChain> {
    let mut chain = HookChain::new();
    for hook in hooks {
        match hook {
            HookYaml::Reachability(r) => {
                let timeout = r.timeout.unwrap_or(secs(5)).into_inner();
                chain.push(Box::new(ReachabilityHook::new(target, timeout)?));
            }
            HookYaml::Health(h) => {
                let timeout = h.timeout.unwrap_or(secs(10)).into_inner();
                chain.push(Box::new(
                    HealthHook::new(client.clone(), join_url(target, &h.path), timeout)
                        .expect_status(h.expect_status.clone()),
                ));
            }
            HookYaml::Login(l) => {
                let timeout = l.timeout.unwrap_or(secs(10)).into_inner();
                let credentials = serde_json::to_value(&l.body)
                    .context("login `body` must be representable as JSON")?;
                chain.push(Box::new(
                    LoginHook::new(client.clone(), join_url(target, &l.path), credentials, timeout)
                        .token_field(l.token_field.clone())
                        .allow_anonymous(l.allow_anonymous),
                ));
            }
        }
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
target: http://localhost:8000/
seed: 42
stages:
  - { duration: 2m, target: 50 }
  - { duration: 5m, target: 50, kind: sustain }
  - { duration: 60, target: 0 }
pacing:
  mode: uniform
  min: 500ms
  max: 2.5
metrics:
  breakdown: [status]
setup:
  - health: { path: /health }
  - login:
      body: { username: loadtest@example.com, password: loadtest }
      allow_anonymous: true
teardown:
  - health: {}
scenarios:
  - name: list_tasks
    weight: 40
    http:
      path: /api/v1/tasks?skip=0&limit=20
      auth: bearer
      expect: { json_array: items }
  - name: create_task
    weight: 30
    timeout: 10s
    http:
      method: post
      path: /api/v1/tasks
      body: { titulo: "Tarea ${vu}", prioridad: "${pick:baja|media|alta}" }
      expect_status: [200, 201]
      expect: { json_field: id }
      capture: { task_id: id }
      then:
        - path: /api/v1/tasks/${task_id}
          auth: bearer
          expect:
            any_of:
              - { json_field: titulo }
              - { json_field: title, contains: "id" }
  - name: ws
    weight: 10
    websocket:
      path: /ws/connect?user_id=user_${vu}
      hold: { min: 30s, max: 90s }
      farewell: '{"type":"ping"}'
      latency_field: timestamp
thresholds:
  latency: "p(95)<500"
  error_rate:
    - expression: rate<0.05
      abort_on_fail: true
      abort_grace: 30s
"#;

    fn plan(yaml: &str, overrides: &Overrides) -> anyhow::Result<RunPlan> {
        parse(yaml)?.into_plan(overrides)
    }

    #[test]
    fn full_run_file_builds_a_plan() -> anyhow::Result<()> {
        let plan = plan(FULL, &Overrides::default())?;

        assert_eq!(plan.target, "http://localhost:8000");
        assert_eq!(plan.config.seed, Some(42));
        assert_eq!(plan.config.stages.len(), 3);
        assert_eq!(plan.config.stages[1].kind, StageKind::Sustain);
        assert_eq!(plan.config.stages[2].duration, Duration::from_secs(60));
        assert_eq!(
            plan.config.pacing,
            Pacing::Uniform {
                min: Duration::from_millis(500),
                max: Duration::from_millis(2500),
            }
        );
        assert_eq!(plan.config.breakdown, vec!["status".to_string()]);

        assert_eq!(plan.scenarios.len(), 3);
        assert_eq!(plan.scenarios.total_weight(), 80.0);
        let kinds: Vec<_> = plan.scenario_info.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec!["http", "http", "websocket"]);
        let create = &plan.scenarios.scenarios()[1];
        assert_eq!(create.timeout, Duration::from_secs(10));

        assert_eq!(plan.setup.len(), 2);
        assert_eq!(plan.teardown.len(), 1);

        assert_eq!(plan.config.thresholds.len(), 2);
        let abort = &plan.config.thresholds[0];
        assert_eq!(abort.metric, "error_rate");
        assert!(abort.abort_on_fail);
        assert_eq!(abort.abort_grace, Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn cli_overrides_replace_stages_target_and_seed() -> anyhow::Result<()> {
        let overrides = Overrides {
            target: Some("http://staging.example.com:8080".to_string()),
            vus: Some(5),
            duration: Some(Duration::from_secs(20)),
            seed: Some(1),
        };
        let plan = plan(FULL, &overrides)?;

        assert_eq!(plan.target, "http://staging.example.com:8080");
        assert_eq!(
            plan.config.stages,
            vec![Stage::sustain(Duration::from_secs(20), 5)]
        );
        assert_eq!(plan.config.seed, Some(1));
        Ok(())
    }

    #[test]
    fn default_setup_is_a_reachability_check() -> anyhow::Result<()> {
        let yaml = r#"
target: http://localhost:8000
stages: [{ duration: 10s, target: 1 }]
scenarios:
  - name: health
    http: { path: /health }
"#;
        let plan = plan(yaml, &Overrides::default())?;
        assert_eq!(plan.setup.len(), 1);
        assert!(plan.teardown.is_empty());
        assert_eq!(plan.config.pacing, Pacing::default());
        Ok(())
    }

    #[test]
    fn invalid_files_are_rejected() {
        let cases = [
            // no target
            "stages: [{ duration: 10s, target: 1 }]\nscenarios: [{ name: a, http: { path: / } }]",
            // unknown field
            "target: http://x\nstagez: []",
            // bad threshold
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: / } }]\nthresholds: { latency: 'p95 < soon' }",
            // both protocols
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: / }, websocket: { path: / } }]",
            // zero weight
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, weight: 0, http: { path: / } }]",
            // no scenarios
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]",
            // run data nobody provides
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: /, headers: { Authorization: 'Bearer ${token}' } } }]",
            // bad template
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: '/${rand:9:1}' } }]",
            // name that would break metric keys
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: 'a{b', http: { path: / } }]",
            // unknown hook
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: / } }]\nsetup: [{ bogus: {} }]",
            // nested chaining
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: /, then: [{ path: /, then: [{ path: / }] }] } }]",
            // reserved capture name
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: /, capture: { vu: id } } }]",
            // empty any_of alternative
            "target: http://x\nstages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: a, http: { path: /, expect: { any_of: [{}] } } }]",
        ];
        for yaml in cases {
            assert!(
                plan(yaml, &Overrides::default()).is_err(),
                "expected rejection:\n{yaml}"
            );
        }
    }

    #[test]
    fn hooks_are_single_key_maps() -> anyhow::Result<()> {
        let file = parse(
            "target: http://x\nsetup:\n  - reachability: { timeout: 2s }\n  - login: { body: { u: a }, token_field: jwt }\nteardown:\n  - health: {}\n",
        )?;
        let setup = file.setup.unwrap_or_default();
        assert!(matches!(setup[0], HookYaml::Reachability(_)));
        assert!(matches!(&setup[1], HookYaml::Login(l) if l.token_field == "jwt"));
        assert!(matches!(file.teardown.as_slice(), [HookYaml::Health(_)]));

        let yaml = r#"
target: http://localhost:8000
stages: [{ duration: 10s, target: 1 }]
scenarios: [{ name: health, http: { path: /health } }]
setup: []
"#;
        assert!(plan(yaml, &Overrides::default())?.setup.is_empty());
        Ok(())
    }

    #[test]
    fn captured_values_need_no_setup_hook() -> anyhow::Result<()> {
        let yaml = r#"
target: http://localhost:8000
stages: [{ duration: 10s, target: 1 }]
setup: []
scenarios:
  - name: create_then_read
    http:
      method: post
      path: /api/v1/tasks
      body: { titulo: t }
      capture: { task_id: id }
      then:
        - path: /api/v1/tasks/${task_id}
        - method: delete
          path: /api/v1/tasks/${task_id}
          expect_status: [204]
"#;
        assert_eq!(plan(yaml, &Overrides::default())?.scenarios.len(), 1);

        // The first request cannot read its own capture.
        let own = yaml.replace("path: /api/v1/tasks\n", "path: /api/v1/tasks?after=${task_id}\n");
        let err = match plan(&own, &Overrides::default()) {
            Ok(_) => anyhow::bail!("self-referencing capture accepted"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("${task_id}"), "{err}");
        Ok(())
    }

    #[test]
    fn any_of_alternatives_combine_their_checks() -> anyhow::Result<()> {
        let expect: ExpectYaml = serde_yaml::from_str(
            "json_field: id\nany_of:\n  - { json_array: '' }\n  - { json_array: items, contains: total }\n",
        )?;
        assert_eq!(
            checks_from_yaml(&expect)?,
            vec![
                BodyCheck::JsonField("id".to_string()),
                BodyCheck::AnyOf(vec![
                    BodyCheck::JsonArray(String::new()),
                    BodyCheck::AllOf(vec![
                        BodyCheck::JsonArray("items".to_string()),
                        BodyCheck::Contains("total".to_string()),
                    ]),
                ]),
            ]
        );
        Ok(())
    }

    #[test]
    fn secure_websocket_targets_are_rejected() {
        let yaml = "stages: [{ duration: 1s, target: 1 }]\nscenarios: [{ name: ws, websocket: { path: /ws } }]";
        let overrides = |target: &str| Overrides {
            target: Some(target.to_string()),
            ..Overrides::default()
        };
        assert!(plan(yaml, &overrides("http://h:1")).is_ok());
        let err = match plan(yaml, &overrides("https://h")) {
            Ok(_) => panic!("wss scenario accepted"),
            Err(e) => format!("{e:#}"),
        };
        assert!(err.contains("wss://"), "{err}");
    }

    #[test]
    fn websocket_base_follows_target_scheme() {
        assert_eq!(ws_base("http://h:1"), "ws://h:1");
        assert_eq!(ws_base("https://h"), "wss://h");
    }
}
