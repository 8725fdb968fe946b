use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::scenario::{
    CloseReason, ErrorKind, Outcome, ScenarioContext, ScenarioFailure, Session, SessionEvent,
    SessionLimits, SessionScenario, SessionStats, Tags,
};

enum Step {
    Continue,
    Cancelled,
    HoldElapsed,
    Idle,
    PeerClosed,
    Failed(ScenarioFailure),
}

/// Counts what arrives on an open session.
struct Tally {
    opened_at: Instant,
    stats: SessionStats,
}

impl Tally {
    fn new(opened_at: Instant) -> Self {
        Self {
            opened_at,
            stats: SessionStats::default(),
        }
    }

    fn observe(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Ack { .. } => self.stats.messages += 1,
            SessionEvent::Message { latency } => {
                self.stats.messages += 1;
                if let Some(latency) = latency {
                    self.stats.message_latencies.push(*latency);
                }
            }
            SessionEvent::Closed => {}
        }
    }

    fn finish(mut self) -> SessionStats {
        self.stats.duration = self.opened_at.elapsed();
        self.stats
    }
}

/// Runs one session: open, wait for the acknowledgment, hold, say goodbye, close.
///
/// Latency is the time to acknowledgment. Returns `None` when cancelled before the
/// acknowledgment arrived.
pub(crate) async fn drive(
    scenario: &dyn SessionScenario,
    name: &Arc<str>,
    open_timeout: Duration,
    ctx: &mut ScenarioContext,
    cancel: &CancellationToken,
) -> Option<Outcome> {
    let limits = scenario.limits(ctx);
    let started = Instant::now();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        r = tokio::time::timeout(open_timeout, scenario.open(ctx)) => Some(r),
    };
    let mut session = match opened? {
        Ok(Ok(session)) => session,
        Ok(Err(failure)) => return Some(Outcome::failure(name.clone(), started.elapsed(), failure)),
        Err(_) => {
            return Some(Outcome::failure(
                name.clone(),
                started.elapsed(),
                ScenarioFailure::timeout(open_timeout),
            ));
        }
    };

    let mut tally = Tally::new(started);
    let acked = await_ack(session.as_mut(), &limits, cancel, &mut tally).await?;
    let outcome = match acked {
        Ok(tags) => {
            let latency = started.elapsed();
            match hold(session.as_mut(), &limits, ctx, cancel, &mut tally).await {
                Ok(()) => Outcome::success(name.clone(), latency, tags),
                Err(failure) => Outcome::failure(name.clone(), latency, failure),
            }
        }
        Err(failure) => Outcome::failure(name.clone(), started.elapsed(), failure),
    };
    Some(outcome.with_session(tally.finish()))
}

/// `None` when cancelled; the session is closed on every path except a peer close.
async fn await_ack(
    session: &mut dyn Session,
    limits: &SessionLimits,
    cancel: &CancellationToken,
    tally: &mut Tally,
) -> Option<Result<Tags, ScenarioFailure>> {
    let deadline = Instant::now() + limits.ack_timeout;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout_at(deadline, session.recv()) => Some(r),
        };
        let Some(event) = event else {
            close(session, CloseReason::Cancelled, limits.close_timeout).await;
            return None;
        };

        match event {
            Ok(Ok(event)) => {
                tally.observe(&event);
                match event {
                    SessionEvent::Ack { tags } => return Some(Ok(tags)),
                    SessionEvent::Message { .. } => continue,
                    SessionEvent::Closed => {
                        return Some(Err(ScenarioFailure::new(
                            ErrorKind::Closed,
                            "closed before acknowledgment",
                        )));
                    }
                }
            }
            Ok(Err(failure)) => {
                close(session, CloseReason::Failed, limits.close_timeout).await;
                return Some(Err(failure));
            }
            Err(_) => {
                close(session, CloseReason::NoAck, limits.close_timeout).await;
                return Some(Err(ScenarioFailure::new(
                    ErrorKind::NoAck,
                    format!("no acknowledgment within {:?}", limits.ack_timeout),
                )));
            }
        }
    }
}

async fn hold(
    session: &mut dyn Session,
    limits: &SessionLimits,
    ctx: &mut ScenarioContext,
    cancel: &CancellationToken,
    tally: &mut Tally,
) -> Result<(), ScenarioFailure> {
    let hold_end = Instant::now() + limits.hold;

    let reason = loop {
        let idle_deadline = (Instant::now() + limits.idle_timeout).min(hold_end);
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            r = tokio::time::timeout_at(idle_deadline, session.recv()) => match r {
                Ok(Ok(SessionEvent::Closed)) => Step::PeerClosed,
                Ok(Ok(event)) => {
                    tally.observe(&event);
                    Step::Continue
                }
                Ok(Err(failure)) => Step::Failed(failure),
                Err(_) if Instant::now() >= hold_end => Step::HoldElapsed,
                Err(_) => Step::Idle,
            },
        };

        match step {
            Step::Continue => continue,
            Step::PeerClosed => return Ok(()),
            Step::Cancelled => break CloseReason::Cancelled,
            Step::Idle => break CloseReason::Idle,
            Step::HoldElapsed => break CloseReason::SessionComplete,
            Step::Failed(failure) => {
                close(session, CloseReason::Failed, limits.close_timeout).await;
                return Err(failure);
            }
        }
    };

    if reason == CloseReason::SessionComplete {
        // The send stalls when the peer stops reading; the close timeout bounds it.
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(limits.close_timeout, session.farewell(ctx)) => Some(r),
        };
        match sent {
            None => {
                close(session, CloseReason::Cancelled, limits.close_timeout).await;
                return Ok(());
            }
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(failure))) => {
                close(session, CloseReason::Failed, limits.close_timeout).await;
                return Err(failure);
            }
            Some(Err(_)) => {
                close(session, CloseReason::Failed, limits.close_timeout).await;
                return Err(ScenarioFailure::timeout(limits.close_timeout));
            }
        }
        if linger(session, limits.linger, cancel, tally).await {
            return Ok(());
        }
    }

    close(session, reason, limits.close_timeout).await;
    Ok(())
}

/// Drains incoming messages until the linger time is over. Returns true if the peer closed.
async fn linger(
    session: &mut dyn Session,
    linger: Duration,
    cancel: &CancellationToken,
    tally: &mut Tally,
) -> bool {
    let deadline = Instant::now() + linger;
    loop {
        let r = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            r = tokio::time::timeout_at(deadline, session.recv()) => r,
        };
        match r {
            Ok(Ok(SessionEvent::Closed)) => return true,
            Ok(Ok(event)) => tally.observe(&event),
            Ok(Err(_)) | Err(_) => return false,
        }
    }
}

async fn close(session: &mut dyn Session, reason: CloseReason, timeout: Duration) {
    match tokio::time::timeout(timeout, session.close(reason.clone())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(%reason, error = %err, "session close failed"),
        Err(_) => tracing::debug!(%reason, ?timeout, "session close timed out"),
    }
}
