use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use rand::Rng as _;
use serde_json::Value;
use stampede_core::{
    CloseReason, ErrorKind, ScenarioContext, ScenarioFailure, Session, SessionEvent, SessionLimits,
    SessionScenario, Tags,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::Error;
use crate::template::Template;
use crate::util::json_path;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How the first server message acknowledges a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMatcher {
    /// JSON field holding the event name.
    pub event_field: String,
    pub event: String,
    /// Dotted path that must be present in the acknowledgment.
    pub require: Option<String>,
}

impl Default for AckMatcher {
    fn default() -> Self {
        Self {
            event_field: "event_type".to_string(),
            event: "CONNECTION_ACK".to_string(),
            require: Some("data.connection_id".to_string()),
        }
    }
}

impl AckMatcher {
    fn matches(&self, msg: &Value) -> Result<bool, ScenarioFailure> {
        let event = json_path(msg, &self.event_field).and_then(Value::as_str);
        if event != Some(self.event.as_str()) {
            return Ok(false);
        }
        if let Some(path) = &self.require
            && json_path(msg, path).is_none_or(Value::is_null)
        {
            return Err(ScenarioFailure::new(
                ErrorKind::Protocol,
                format!("{} without `{path}`", self.event),
            ));
        }
        Ok(true)
    }
}

/// Delivery delay of a message stamped with its send time: an RFC 3339 string or a Unix
/// epoch number in seconds or milliseconds. Only plausible delays (under a minute) count.
fn delivery_delay(stamp: &Value, now: SystemTime) -> Option<Duration> {
    let sent = match stamp {
        Value::String(text) => {
            let text = text.trim();
            let text = text
                .strip_suffix("+00:00")
                .or_else(|| text.strip_suffix('Z'))
                .unwrap_or(text);
            humantime::parse_rfc3339_weak(text).ok()?
        }
        // Anything past 1e11 is in milliseconds (year 5138 in seconds).
        Value::Number(n) => match n.as_u64() {
            Some(ms) if ms > EPOCH_MILLIS_FLOOR => UNIX_EPOCH + Duration::from_millis(ms),
            _ => {
                let v = n.as_f64().filter(|v| v.is_finite() && *v > 0.0)?;
                let secs = if v > EPOCH_MILLIS_FLOOR as f64 { v / 1_000.0 } else { v };
                UNIX_EPOCH + Duration::try_from_secs_f64(secs).ok()?
            }
        },
        _ => return None,
    };
    now.duration_since(sent)
        .ok()
        .filter(|d| *d < MAX_DELIVERY_DELAY)
}

const MAX_DELIVERY_DELAY: Duration = Duration::from_secs(60);
const EPOCH_MILLIS_FLOOR: u64 = 100_000_000_000;

/// A persistent WebSocket connection held open for a random time.
#[derive(Debug, Clone)]
pub struct WsScenario {
    url: Template,
    ack: AckMatcher,
    latency_field: Option<String>,
    hold_min: Duration,
    hold_max: Duration,
    ack_timeout: Duration,
    idle_timeout: Duration,
    linger: Duration,
    close_timeout: Duration,
    farewell: Option<Template>,
}

impl WsScenario {
    pub fn new(url: Template) -> Self {
        Self {
            url,
            ack: AckMatcher::default(),
            latency_field: None,
            hold_min: Duration::from_secs(30),
            hold_max: Duration::from_secs(90),
            ack_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            linger: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
            farewell: None,
        }
    }

    #[must_use]
    pub fn ack(mut self, ack: AckMatcher) -> Self {
        self.ack = ack;
        self
    }

    /// Dotted path of the send time in server messages; their delivery delay is recorded.
    #[must_use]
    pub fn latency_field(mut self, path: impl Into<String>) -> Self {
        self.latency_field = Some(path.into());
        self
    }

    /// Each session is held for a uniform draw from `min..=max`.
    #[must_use]
    pub fn hold(mut self, min: Duration, max: Duration) -> Self {
        self.hold_min = min;
        self.hold_max = max.max(min);
        self
    }

    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Message sent once the hold time is over.
    #[must_use]
    pub fn farewell(mut self, message: Template) -> Self {
        self.farewell = Some(message);
        self
    }
}

#[async_trait]
impl SessionScenario for WsScenario {
    fn limits(&self, ctx: &mut ScenarioContext) -> SessionLimits {
        let hold = if self.hold_max > self.hold_min {
            ctx.rng.gen_range(self.hold_min..=self.hold_max)
        } else {
            self.hold_min
        };
        SessionLimits {
            hold,
            ack_timeout: self.ack_timeout,
            idle_timeout: self.idle_timeout,
            linger: self.linger,
            close_timeout: self.close_timeout,
        }
    }

    async fn open(&self, ctx: &mut ScenarioContext) -> Result<Box<dyn Session>, ScenarioFailure> {
        let url = self.url.render(ctx)?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(Error::from)?;
        tracing::trace!(vu = ctx.vu_id, %url, "websocket connected");
        Ok(Box::new(WsSession {
            stream,
            ack: self.ack.clone(),
            acked: false,
            latency_field: self.latency_field.clone(),
            farewell: self.farewell.clone(),
        }))
    }
}

struct WsSession {
    stream: Stream,
    ack: AckMatcher,
    acked: bool,
    latency_field: Option<String>,
    farewell: Option<Template>,
}

impl WsSession {
    fn message(&self, value: Option<&Value>) -> SessionEvent {
        let latency = self
            .latency_field
            .as_deref()
            .zip(value)
            .and_then(|(path, v)| json_path(v, path))
            .and_then(|stamp| delivery_delay(stamp, SystemTime::now()));
        SessionEvent::Message { latency }
    }
}

#[async_trait]
impl Session for WsSession {
    async fn recv(&mut self) -> Result<SessionEvent, ScenarioFailure> {
        use tokio_tungstenite::tungstenite::Error as WsError;

        loop {
            let msg = match self.stream.next().await {
                None
                | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))
                | Some(Ok(Message::Close(_))) => return Ok(SessionEvent::Closed),
                Some(Err(e)) => return Err(Error::from(e).into()),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Text(text) => {
                    let value = serde_json::from_str::<Value>(text.as_str()).ok();
                    if !self.acked
                        && let Some(v) = &value
                        && self.ack.matches(v)?
                    {
                        self.acked = true;
                        return Ok(SessionEvent::Ack { tags: Tags::new() });
                    }
                    return Ok(self.message(value.as_ref()));
                }
                Message::Binary(_) => return Ok(self.message(None)),
                // Control frames are answered by tungstenite on the next read.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(_) => return Ok(SessionEvent::Closed),
            }
        }
    }

    async fn farewell(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioFailure> {
        let Some(template) = &self.farewell else {
            return Ok(());
        };
        let payload = template.render(ctx)?;
        self.stream
            .send(Message::text(payload))
            .await
            .map_err(|e| Error::from(e).into())
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), ScenarioFailure> {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let code = match reason {
            CloseReason::SessionComplete | CloseReason::Cancelled | CloseReason::Idle => {
                CloseCode::Normal
            }
            CloseReason::NoAck | CloseReason::Failed => CloseCode::Policy,
        };
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(Error::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng as _;
    use rand::rngs::StdRng;
    use serde_json::json;
    use stampede_core::RunData;
    use std::sync::Arc;

    #[test]
    fn ack_matcher_requires_connection_id() {
        let ack = AckMatcher::default();
        let ok = json!({ "event_type": "CONNECTION_ACK", "data": { "connection_id": "c-1" } });
        assert!(matches!(ack.matches(&ok), Ok(true)));

        let other = json!({ "event_type": "PONG" });
        assert!(matches!(ack.matches(&other), Ok(false)));

        let incomplete = json!({ "event_type": "CONNECTION_ACK", "data": {} });
        let err = ack
            .matches(&incomplete)
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn delivery_delay_reads_epoch_and_rfc3339_stamps() {
        let now = UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let ms = Duration::from_millis;

        assert_eq!(delivery_delay(&json!(1_700_000_000_200u64), now), Some(ms(50)));
        assert_eq!(delivery_delay(&json!(1_700_000_000.0), now), Some(ms(250)));
        for stamp in [
            "2023-11-14T22:13:20.000Z",
            "2023-11-14T22:13:20+00:00",
            "2023-11-14T22:13:20",
        ] {
            assert_eq!(delivery_delay(&json!(stamp), now), Some(ms(250)), "{stamp}");
        }

        // From the future, too old, or not a time at all.
        assert_eq!(delivery_delay(&json!(1_700_000_001_000u64), now), None);
        assert_eq!(delivery_delay(&json!(1_699_999_000_000u64), now), None);
        assert_eq!(delivery_delay(&json!("soon"), now), None);
        assert_eq!(delivery_delay(&json!(null), now), None);
    }

    #[test]
    fn hold_is_drawn_from_the_range() {
        let url = Template::parse("ws://localhost/ws").unwrap_or_else(|e| panic!("{e}"));
        let scenario = WsScenario::new(url).hold(Duration::from_secs(30), Duration::from_secs(90));
        let mut ctx = ScenarioContext {
            vu_id: 1,
            iteration: 0,
            rng: StdRng::seed_from_u64(9),
            data: Arc::new(RunData::default()),
        };
        for _ in 0..100 {
            let limits = scenario.limits(&mut ctx);
            assert!(limits.hold >= Duration::from_secs(30));
            assert!(limits.hold <= Duration::from_secs(90));
            assert_eq!(limits.linger, Duration::from_secs(1));
        }
    }
}
