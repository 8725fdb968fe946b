use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Think time between two executions of the same worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Pacing {
    /// Sleeps less as the pool grows: `max(min, base * (1 - live / max_concurrency))`.
    Adaptive {
        base: Duration,
        min: Duration,
        /// Defaults to the plan peak.
        max_concurrency: Option<u64>,
    },
    Fixed(Duration),
    /// Uniform random sleep in `[min, max]`.
    Uniform { min: Duration, max: Duration },
}

impl Default for Pacing {
    fn default() -> Self {
        Self::Adaptive {
            base: Duration::from_secs(1),
            min: Duration::from_millis(100),
            max_concurrency: None,
        }
    }
}

impl Pacing {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Adaptive {
                base,
                min,
                max_concurrency,
            } => {
                if min.is_zero() {
                    return Err(ConfigError::InvalidPacing(
                        "adaptive `min` must be positive".to_string(),
                    ));
                }
                if min > base {
                    return Err(ConfigError::InvalidPacing(format!(
                        "adaptive `min` ({min:?}) exceeds `base` ({base:?})"
                    )));
                }
                if *max_concurrency == Some(0) {
                    return Err(ConfigError::InvalidPacing(
                        "`max_concurrency` must be positive".to_string(),
                    ));
                }
            }
            Self::Fixed(delay) => {
                if delay.is_zero() {
                    return Err(ConfigError::InvalidPacing(
                        "fixed `delay` must be positive".to_string(),
                    ));
                }
            }
            Self::Uniform { min, max } => {
                if max.is_zero() {
                    return Err(ConfigError::InvalidPacing(
                        "uniform `max` must be positive".to_string(),
                    ));
                }
                if min > max {
                    return Err(ConfigError::InvalidPacing(format!(
                        "uniform `min` ({min:?}) exceeds `max` ({max:?})"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn delay<R: Rng + ?Sized>(&self, live: u64, peak: u64, rng: &mut R) -> Duration {
        match self {
            Self::Adaptive {
                base,
                min,
                max_concurrency,
            } => {
                let max = max_concurrency.unwrap_or(peak).max(1);
                let load = (live as f64 / max as f64).min(1.0);
                base.mul_f64(1.0 - load).max(*min)
            }
            Self::Fixed(d) => *d,
            Self::Uniform { min, max } => {
                if min == max {
                    return *min;
                }
                let nanos = rng.gen_range(min.as_nanos()..=max.as_nanos());
                Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
            }
        }
    }
}

/// Exponential pause after repeated transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive transport failures before backing off.
    pub after: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            after: 3,
        }
    }
}

impl Backoff {
    /// `base * 2^(n - after)`, capped at `max`; `None` below the threshold.
    pub fn delay(&self, consecutive_failures: u32) -> Option<Duration> {
        if self.after == 0 || consecutive_failures < self.after {
            return None;
        }
        let exp = (consecutive_failures - self.after).min(31);
        Some(self.base.saturating_mul(1u32 << exp).min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1)
    }

    #[test]
    fn adaptive_pacing_shrinks_with_load() {
        let p = Pacing::default();
        assert_eq!(p.delay(0, 200, &mut rng()), Duration::from_secs(1));
        assert_eq!(p.delay(100, 200, &mut rng()), Duration::from_millis(500));
        assert_eq!(p.delay(190, 200, &mut rng()), Duration::from_millis(100));
        assert_eq!(p.delay(500, 200, &mut rng()), Duration::from_millis(100));
    }

    #[test]
    fn adaptive_pacing_prefers_explicit_max_concurrency() {
        let p = Pacing::Adaptive {
            base: Duration::from_secs(1),
            min: Duration::ZERO,
            max_concurrency: Some(10),
        };
        assert_eq!(p.delay(5, 1000, &mut rng()), Duration::from_millis(500));
    }

    #[test]
    fn uniform_pacing_stays_in_range() {
        let p = Pacing::Uniform {
            min: Duration::from_millis(500),
            max: Duration::from_millis(2500),
        };
        let mut rng = rng();
        for _ in 0..1000 {
            let d = p.delay(1, 1, &mut rng);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let p = Pacing::Uniform {
            min: Duration::from_secs(2),
            max: Duration::from_secs(1),
        };
        assert!(matches!(p.validate(), Err(ConfigError::InvalidPacing(_))));
    }

    #[test]
    fn zero_think_time_is_rejected() {
        let zero = [
            Pacing::Fixed(Duration::ZERO),
            Pacing::Adaptive {
                base: Duration::from_secs(1),
                min: Duration::ZERO,
                max_concurrency: None,
            },
            Pacing::Uniform {
                min: Duration::ZERO,
                max: Duration::ZERO,
            },
        ];
        for p in zero {
            assert!(
                matches!(p.validate(), Err(ConfigError::InvalidPacing(_))),
                "{p:?} should be rejected"
            );
        }
        assert!(Pacing::default().validate().is_ok());
        assert!(Pacing::Fixed(Duration::from_millis(1)).validate().is_ok());
    }

    #[test]
    fn backoff_doubles_after_threshold_and_caps() {
        let b = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(700),
            after: 3,
        };
        assert_eq!(b.delay(2), None);
        assert_eq!(b.delay(3), Some(Duration::from_millis(100)));
        assert_eq!(b.delay(4), Some(Duration::from_millis(200)));
        assert_eq!(b.delay(5), Some(Duration::from_millis(400)));
        assert_eq!(b.delay(6), Some(Duration::from_millis(700)));
        assert_eq!(b.delay(60), Some(Duration::from_millis(700)));
    }
}
