use std::sync::Arc;

use rand::Rng;
use stampede_metrics::is_plain_tag;

use crate::error::ConfigError;
use crate::scenario::ScenarioSpec;

#[derive(Debug, Default)]
pub struct ScenarioRegistryBuilder {
    specs: Vec<ScenarioSpec>,
}

impl ScenarioRegistryBuilder {
    pub fn register(&mut self, spec: ScenarioSpec) -> Result<&mut Self, ConfigError> {
        if !is_plain_tag(&spec.name) {
            return Err(ConfigError::InvalidScenario {
                name: spec.name.to_string(),
                reason: "name must be non-empty and free of `{`, `}`, `,` and `=`".to_string(),
            });
        }
        if !spec.weight.is_finite() || spec.weight <= 0.0 {
            return Err(ConfigError::InvalidScenario {
                name: spec.name.to_string(),
                reason: format!("weight must be a positive number (got {})", spec.weight),
            });
        }
        if spec.timeout.is_zero() {
            return Err(ConfigError::InvalidScenario {
                name: spec.name.to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }
        if self.specs.iter().any(|s| s.name == spec.name) {
            return Err(ConfigError::DuplicateScenario(spec.name.to_string()));
        }

        self.specs.push(spec);
        Ok(self)
    }

    pub fn build(self) -> Result<ScenarioRegistry, ConfigError> {
        if self.specs.is_empty() {
            return Err(ConfigError::NoScenarios);
        }

        let mut cumulative = Vec::with_capacity(self.specs.len());
        let mut acc = 0.0;
        for s in &self.specs {
            acc += s.weight;
            cumulative.push(acc);
        }
        if !acc.is_finite() {
            return Err(ConfigError::TotalWeight);
        }

        Ok(ScenarioRegistry {
            specs: self.specs.into_iter().map(Arc::new).collect(),
            cumulative,
            total: acc,
        })
    }
}

/// Weighted scenario table. Immutable once built; shared by every worker.
#[derive(Debug)]
pub struct ScenarioRegistry {
    specs: Vec<Arc<ScenarioSpec>>,
    cumulative: Vec<f64>,
    total: f64,
}

impl ScenarioRegistry {
    pub fn builder() -> ScenarioRegistryBuilder {
        ScenarioRegistryBuilder::default()
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    pub fn scenarios(&self) -> &[Arc<ScenarioSpec>] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &Arc<ScenarioSpec> {
        let draw = rng.gen_range(0.0..self.total);
        self.select_at(draw)
    }

    /// First scenario, in registration order, whose cumulative weight is strictly greater
    /// than `draw`.
    pub fn select_at(&self, draw: f64) -> &Arc<ScenarioSpec> {
        let idx = self.cumulative.partition_point(|c| *c <= draw);
        &self.specs[idx.min(self.specs.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{RequestScenario, ScenarioContext, ScenarioFailure, Tags};
    use async_trait::async_trait;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Noop;

    #[async_trait]
    impl RequestScenario for Noop {
        async fn execute(&self, _ctx: &mut ScenarioContext) -> Result<Tags, ScenarioFailure> {
            Ok(Tags::new())
        }
    }

    fn registry(weights: &[(&str, f64)]) -> ScenarioRegistry {
        let mut b = ScenarioRegistry::builder();
        for (name, w) in weights {
            b.register(ScenarioSpec::request(name, *w, Noop))
                .unwrap_or_else(|e| panic!("{e}"));
        }
        b.build().unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn select_at_uses_strictly_greater_cumulative_weight() {
        let r = registry(&[("a", 1.0), ("b", 2.0), ("c", 1.0)]);
        assert_eq!(&*r.select_at(0.0).name, "a");
        assert_eq!(&*r.select_at(0.999).name, "a");
        assert_eq!(&*r.select_at(1.0).name, "b");
        assert_eq!(&*r.select_at(2.999).name, "b");
        assert_eq!(&*r.select_at(3.0).name, "c");
        assert_eq!(&*r.select_at(4.0).name, "c");
    }

    #[test]
    fn selection_frequency_converges_to_weights() {
        let weights = [("health", 0.1), ("list", 0.5), ("create", 0.3), ("metrics", 0.1)];
        let r = registry(&weights);
        let mut rng = StdRng::seed_from_u64(7);

        let draws = 100_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            let picked = r.select(&mut rng);
            let idx = weights
                .iter()
                .position(|(n, _)| *n == &*picked.name)
                .unwrap_or_else(|| panic!("unknown scenario {}", picked.name));
            counts[idx] += 1;
        }

        for (i, (name, w)) in weights.iter().enumerate() {
            let observed = counts[i] as f64 / draws as f64;
            assert!(
                (observed - w).abs() <= 0.02,
                "{name}: expected {w}, observed {observed}"
            );
        }
    }

    #[test]
    fn non_positive_weights_are_rejected() {
        for w in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut b = ScenarioRegistry::builder();
            let err = b.register(ScenarioSpec::request("bad", w, Noop));
            assert!(
                matches!(err, Err(ConfigError::InvalidScenario { .. })),
                "weight {w} should be rejected"
            );
        }
    }

    #[test]
    fn overflowing_total_weight_is_rejected() {
        let mut b = ScenarioRegistry::builder();
        for name in ["a", "b"] {
            b.register(ScenarioSpec::request(name, 1e308, Noop))
                .unwrap_or_else(|e| panic!("{e}"));
        }
        assert!(matches!(b.build(), Err(ConfigError::TotalWeight)));
    }

    #[test]
    fn names_that_break_metric_keys_are_rejected() {
        for name in ["", "list{x}", "a,b", "kind=timeout"] {
            let mut b = ScenarioRegistry::builder();
            let err = b.register(ScenarioSpec::request(name, 1.0, Noop));
            assert!(
                matches!(err, Err(ConfigError::InvalidScenario { .. })),
                "`{name}` should be rejected"
            );
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = ScenarioRegistry::builder();
        b.register(ScenarioSpec::request("a", 1.0, Noop))
            .unwrap_or_else(|e| panic!("{e}"));
        let err = b.register(ScenarioSpec::request("a", 2.0, Noop));
        assert!(matches!(err, Err(ConfigError::DuplicateScenario(name)) if name == "a"));
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert!(matches!(
            ScenarioRegistry::builder().build(),
            Err(ConfigError::NoScenarios)
        ));
    }
}
