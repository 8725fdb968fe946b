use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use stampede_metrics::{MetricSeries, MetricSnapshot, Registry, tagged_metric_name};

use crate::scenario::{ErrorKind, Outcome};

pub const LATENCY: &str = "latency";
pub const ERROR_RATE: &str = "error_rate";
pub const ERRORS: &str = "errors";
pub const SESSION_DURATION: &str = "session_duration";
pub const SESSION_MESSAGES: &str = "session_messages";
pub const MESSAGE_LATENCY: &str = "message_latency";

#[derive(Debug, Clone)]
struct ScenarioSeries {
    latency: Arc<MetricSeries>,
    error_rate: Arc<MetricSeries>,
}

/// Session series, overall and for one scenario.
#[derive(Debug, Clone)]
struct SessionSeries {
    duration: [Arc<MetricSeries>; 2],
    messages: [Arc<MetricSeries>; 2],
    message_latency: [Arc<MetricSeries>; 2],
}

/// Folds outcomes into the well-known series of the metric registry.
#[derive(Debug)]
pub struct Aggregator {
    registry: Registry,
    breakdown: Vec<String>,
    latency: Arc<MetricSeries>,
    error_rate: Arc<MetricSeries>,
    by_scenario: DashMap<Arc<str>, ScenarioSeries>,
    by_error: DashMap<ErrorKind, Arc<MetricSeries>>,
    by_session: DashMap<Arc<str>, SessionSeries>,
}

impl Aggregator {
    /// `breakdown` lists outcome tag keys that get their own per-scenario latency series.
    pub fn new(registry: Registry, breakdown: Vec<String>) -> Self {
        let latency = registry.series(LATENCY);
        let error_rate = registry.series(ERROR_RATE);
        Self {
            registry,
            breakdown,
            latency,
            error_rate,
            by_scenario: DashMap::new(),
            by_error: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe(&self, outcome: &Outcome) {
        let us = duration_us(outcome.latency);

        self.latency.record(us, outcome.success);
        self.error_rate.record(us, !outcome.success);

        let scenario = self.scenario_series(&outcome.scenario);
        scenario.latency.record(us, outcome.success);
        scenario.error_rate.record(us, !outcome.success);

        if let Some(kind) = outcome.error_kind {
            self.error_series(kind).mark(true);
        }

        if let Some(stats) = &outcome.session {
            let series = self.session_series(&outcome.scenario);
            let duration = duration_us(stats.duration);
            for s in &series.duration {
                s.record(duration, outcome.success);
            }
            for _ in 0..stats.messages {
                for s in &series.messages {
                    s.mark(true);
                }
            }
            for latency in &stats.message_latencies {
                let latency = duration_us(*latency);
                for s in &series.message_latency {
                    s.record(latency, true);
                }
            }
        }

        let scenario_name: &str = &outcome.scenario;
        for key in &self.breakdown {
            let Some(value) = outcome.tags.get(key) else {
                continue;
            };
            let name = tagged_metric_name(
                LATENCY,
                &[("scenario", scenario_name), (key.as_str(), value.as_str())],
            );
            self.registry.series(&name).record(us, outcome.success);
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<MetricSnapshot> {
        self.registry.snapshot(name)
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, MetricSnapshot> {
        self.registry.snapshot_all()
    }

    /// Outcomes observed so far, and how many of them failed.
    pub fn totals(&self) -> (u64, u64) {
        self.error_rate.counts()
    }

    fn scenario_series(&self, scenario: &Arc<str>) -> ScenarioSeries {
        if let Some(s) = self.by_scenario.get(scenario) {
            return s.value().clone();
        }

        let name: &str = scenario;
        self.by_scenario
            .entry(scenario.clone())
            .or_insert_with(|| ScenarioSeries {
                latency: self
                    .registry
                    .series(&tagged_metric_name(LATENCY, &[("scenario", name)])),
                error_rate: self
                    .registry
                    .series(&tagged_metric_name(ERROR_RATE, &[("scenario", name)])),
            })
            .value()
            .clone()
    }

    fn session_series(&self, scenario: &Arc<str>) -> SessionSeries {
        if let Some(s) = self.by_session.get(scenario) {
            return s.value().clone();
        }

        let name: &str = scenario;
        let pair = |base: &str| {
            [
                self.registry.series(base),
                self.registry
                    .series(&tagged_metric_name(base, &[("scenario", name)])),
            ]
        };
        self.by_session
            .entry(scenario.clone())
            .or_insert_with(|| SessionSeries {
                duration: pair(SESSION_DURATION),
                messages: pair(SESSION_MESSAGES),
                message_latency: pair(MESSAGE_LATENCY),
            })
            .value()
            .clone()
    }

    fn error_series(&self, kind: ErrorKind) -> Arc<MetricSeries> {
        self.by_error
            .entry(kind)
            .or_insert_with(|| {
                self.registry
                    .series(&tagged_metric_name(ERRORS, &[("kind", kind.as_ref())]))
            })
            .value()
            .clone()
    }
}

fn duration_us(d: std::time::Duration) -> u64 {
    d.as_micros().min(u128::from(u64::MAX)) as u64
}
