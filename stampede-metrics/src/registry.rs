use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use hdrhistogram::Histogram;

use crate::Result;
use crate::histogram::HistogramConfig;
use crate::series::{MetricSeries, MetricSnapshot};

/// Named metric series, created lazily on first use and kept for the life of the run.
#[derive(Debug)]
pub struct Registry {
    config: HistogramConfig,
    /// Empty histogram every new series is shaped after.
    template: Histogram<u64>,
    series: DashMap<Arc<str>, Arc<MetricSeries>>,
}

impl Registry {
    /// Creates a registry whose series use `config`, lowering the histogram precision when the
    /// requested one would not fit the memory budget.
    pub fn new(config: HistogramConfig) -> Result<Self> {
        let fitted = config.fit_to_memory_limit()?;
        if fitted.significant_figures != config.significant_figures {
            tracing::warn!(
                requested = config.significant_figures,
                used = fitted.significant_figures,
                memory_limit_bytes = config.memory_limit_bytes,
                "histogram precision reduced to fit the memory limit"
            );
        }

        Ok(Self {
            template: fitted.build()?,
            config: fitted,
            series: DashMap::new(),
        })
    }

    pub fn histogram_config(&self) -> HistogramConfig {
        self.config
    }

    /// Returns the series for `name`, creating it on first use.
    pub fn series(&self, name: &str) -> Arc<MetricSeries> {
        if let Some(existing) = self.series.get(name) {
            return existing.value().clone();
        }

        self.series
            .entry(Arc::from(name))
            .or_insert_with(|| {
                Arc::new(MetricSeries::from_template(
                    &self.template,
                    self.config.max_value_us,
                ))
            })
            .value()
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<MetricSeries>> {
        self.series.get(name).map(|s| s.value().clone())
    }

    pub fn snapshot(&self, name: &str) -> Option<MetricSnapshot> {
        self.get(name).map(|s| s.snapshot())
    }

    /// Snapshots of every series, ordered by name.
    pub fn snapshot_all(&self) -> BTreeMap<String, MetricSnapshot> {
        let series: Vec<(Arc<str>, Arc<MetricSeries>)> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        series
            .into_iter()
            .map(|(name, s)| (name.to_string(), s.snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
