use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::pacing::{Backoff, Pacing};
use crate::registry::ScenarioRegistry;
use crate::scenario::{Outcome, RunData, ScenarioContext, ScenarioExec, ScenarioFailure};
use crate::session;

/// State shared by every worker of a run.
pub(crate) struct VuShared {
    pub registry: Arc<ScenarioRegistry>,
    pub aggregator: Arc<Aggregator>,
    pub data: Arc<RunData>,
    pub pacing: Pacing,
    pub backoff: Backoff,
    pub live: Arc<AtomicU64>,
    pub peak_live: Arc<AtomicU64>,
    pub peak: u64,
}

/// Keeps the live worker count while a worker task is running.
struct ActiveVuGuard {
    live: Arc<AtomicU64>,
}

impl ActiveVuGuard {
    fn enter(live: &Arc<AtomicU64>, peak: &AtomicU64) -> Self {
        let new_active = live.fetch_add(1, Ordering::Relaxed).saturating_add(1);

        let mut cur = peak.load(Ordering::Relaxed);
        while new_active > cur {
            match peak.compare_exchange_weak(cur, new_active, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }

        Self { live: live.clone() }
    }
}

impl Drop for ActiveVuGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One simulated client.
#[derive(Debug)]
pub struct VirtualUser {
    pub id: u64,
    pub rng_seed: u64,
    pub cancel: CancellationToken,
}

impl VirtualUser {
    /// Derives a per-worker seed from the run seed.
    pub fn seed_for(run_seed: u64, id: u64) -> u64 {
        // splitmix64 step so neighbouring ids get unrelated streams.
        let mut z = run_seed.wrapping_add(id.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Runs the select / execute / record / pace loop until cancelled. Returns the number of
    /// executions started.
    pub(crate) async fn run(self, shared: Arc<VuShared>) -> u64 {
        let _active = ActiveVuGuard::enter(&shared.live, &shared.peak_live);
        let cancel = self.cancel;

        let mut ctx = ScenarioContext {
            vu_id: self.id,
            iteration: 0,
            rng: StdRng::seed_from_u64(self.rng_seed),
            data: shared.data.clone(),
        };
        let mut transport_failures: u32 = 0;
        let mut started_total: u64 = 0;

        while !cancel.is_cancelled() {
            if let Some(delay) = shared.backoff.delay(transport_failures) {
                tracing::debug!(
                    vu = self.id,
                    failures = transport_failures,
                    ?delay,
                    "backing off after transport failures"
                );
                if !sleep_or_cancel(delay, &cancel).await {
                    break;
                }
            }

            let spec = shared.registry.select(&mut ctx.rng).clone();
            started_total += 1;

            let outcome = match &spec.exec {
                ScenarioExec::Request(scenario) => {
                    let started = Instant::now();
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        r = tokio::time::timeout(spec.timeout, scenario.execute(&mut ctx)) => Some(r),
                    };
                    // Abandoned in flight; not an outcome.
                    let Some(result) = result else {
                        break;
                    };
                    let latency = started.elapsed();
                    match result {
                        Ok(Ok(tags)) => Some(Outcome::success(spec.name.clone(), latency, tags)),
                        Ok(Err(failure)) => {
                            Some(Outcome::failure(spec.name.clone(), latency, failure))
                        }
                        Err(_) => Some(Outcome::failure(
                            spec.name.clone(),
                            latency,
                            ScenarioFailure::timeout(spec.timeout),
                        )),
                    }
                }
                ScenarioExec::Session(scenario) => {
                    session::drive(
                        scenario.as_ref(),
                        &spec.name,
                        spec.timeout,
                        &mut ctx,
                        &cancel,
                    )
                    .await
                }
            };
            ctx.iteration = ctx.iteration.saturating_add(1);

            let Some(outcome) = outcome else {
                break;
            };

            if outcome.error_kind.is_some_and(|k| k.is_transport()) {
                transport_failures = transport_failures.saturating_add(1);
            } else {
                transport_failures = 0;
            }
            shared.aggregator.observe(&outcome);

            let delay = shared.pacing.delay(
                shared.live.load(Ordering::Relaxed),
                shared.peak,
                &mut ctx.rng,
            );
            if !sleep_or_cancel(delay, &cancel).await {
                break;
            }
        }

        started_total
    }
}

/// Returns false if cancelled before the sleep finished.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
