use hdrhistogram::Histogram;

use crate::error::{Error, Result};

/// Default upper bound: 1 hour in microseconds.
pub const DEFAULT_MAX_VALUE_US: u64 = 3_600_000_000;

/// Bounds of the per-series latency histogram. Values are recorded in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramConfig {
    pub max_value_us: u64,
    pub significant_figures: u8,
    /// Budget for the counts array of a single series.
    pub memory_limit_bytes: usize,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            max_value_us: DEFAULT_MAX_VALUE_US,
            significant_figures: 3,
            memory_limit_bytes: 1024 * 1024,
        }
    }
}

impl HistogramConfig {
    /// Picks the highest precision (up to the requested one) whose counts array fits in the
    /// memory budget. Returns the adjusted config; `significant_figures` only ever goes down.
    pub fn fit_to_memory_limit(self) -> Result<Self> {
        if !(1..=5).contains(&self.significant_figures) {
            return Err(Error::SignificantFigures(self.significant_figures));
        }

        let mut sigfig = self.significant_figures;
        loop {
            let h = Histogram::<u64>::new_with_bounds(1, self.max_value_us, sigfig)
                .map_err(Error::HistogramBounds)?;
            let bytes = h.distinct_values().saturating_mul(std::mem::size_of::<u64>());
            if bytes <= self.memory_limit_bytes || sigfig == 1 {
                return Ok(Self {
                    significant_figures: sigfig,
                    ..self
                });
            }
            sigfig -= 1;
        }
    }

    pub fn build(&self) -> Result<Histogram<u64>> {
        Histogram::<u64>::new_with_bounds(1, self.max_value_us, self.significant_figures)
            .map_err(Error::HistogramBounds)
    }
}
