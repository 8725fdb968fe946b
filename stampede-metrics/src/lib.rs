pub mod error;
pub mod histogram;
pub mod name;
pub mod registry;
pub mod series;
pub mod stats;

pub use error::{Error, Result};
pub use histogram::HistogramConfig;
pub use name::{is_plain_tag, split_metric_name, tagged_metric_name};
pub use registry::Registry;
pub use series::{MetricSeries, MetricSnapshot};
pub use stats::{RunningStats, per_sec};
