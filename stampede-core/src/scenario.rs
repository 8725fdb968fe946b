use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::Serialize;

pub type Tags = BTreeMap<String, String>;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ConnectionRefused,
    Connect,
    Timeout,
    Status,
    Parse,
    Protocol,
    NoAck,
    Closed,
    Other,
}

impl ErrorKind {
    /// The target could not be reached at all.
    pub fn is_transport(self) -> bool {
        matches!(self, Self::ConnectionRefused | Self::Connect)
    }
}

/// A failed scenario execution. Recorded as a failed outcome; never stops a worker.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScenarioFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub tags: Tags,
}

impl ScenarioFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tags: Tags::new(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("timed out after {after:?}"))
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// What happened on an opened session besides its acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// From the connection attempt until the session was closed.
    pub duration: Duration,
    /// Messages received, the acknowledgment included.
    pub messages: u64,
    /// Delivery delays of messages that carried a send time.
    pub message_latencies: Vec<Duration>,
}

/// Result of one scenario execution.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub scenario: Arc<str>,
    pub success: bool,
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub tags: Tags,
    /// Set for sessions that were opened.
    pub session: Option<SessionStats>,
}

impl Outcome {
    pub fn success(scenario: Arc<str>, latency: Duration, tags: Tags) -> Self {
        Self {
            scenario,
            success: true,
            latency,
            error_kind: None,
            tags,
            session: None,
        }
    }

    pub fn failure(scenario: Arc<str>, latency: Duration, failure: ScenarioFailure) -> Self {
        Self {
            scenario,
            success: false,
            latency,
            error_kind: Some(failure.kind),
            tags: failure.tags,
            session: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, stats: SessionStats) -> Self {
        self.session = Some(stats);
        self
    }
}

/// Values produced by setup hooks (auth token and friends). Read-only once the run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunData {
    values: BTreeMap<String, String>,
}

impl RunData {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-worker state handed to every scenario execution.
#[derive(Debug)]
pub struct ScenarioContext {
    pub vu_id: u64,
    /// 0-based count of executions this worker has started.
    pub iteration: u64,
    pub rng: StdRng,
    pub data: Arc<RunData>,
}

/// One bounded request/response exchange.
#[async_trait]
pub trait RequestScenario: Send + Sync {
    async fn execute(&self, ctx: &mut ScenarioContext) -> Result<Tags, ScenarioFailure>;
}

/// Timing limits of one session, chosen by the scenario for every execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// How long to keep the session open after the acknowledgment.
    pub hold: Duration,
    pub ack_timeout: Duration,
    /// Ends the session early when nothing is received for this long.
    pub idle_timeout: Duration,
    /// Wait between [`Session::farewell`] and the close.
    pub linger: Duration,
    pub close_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    SessionComplete,
    Cancelled,
    Idle,
    NoAck,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer acknowledged the session.
    Ack { tags: Tags },
    /// Any other message. `latency` is set when the message carried its send time.
    Message { latency: Option<Duration> },
    /// The peer closed the session.
    Closed,
}

/// An open persistent connection. The worker drives the receive loop.
#[async_trait]
pub trait Session: Send {
    async fn recv(&mut self) -> Result<SessionEvent, ScenarioFailure>;

    /// Sent once the hold time is over, right before lingering and closing.
    async fn farewell(&mut self, _ctx: &mut ScenarioContext) -> Result<(), ScenarioFailure> {
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), ScenarioFailure>;
}

#[async_trait]
pub trait SessionScenario: Send + Sync {
    fn limits(&self, ctx: &mut ScenarioContext) -> SessionLimits;

    async fn open(&self, ctx: &mut ScenarioContext) -> Result<Box<dyn Session>, ScenarioFailure>;
}

#[derive(Clone)]
pub enum ScenarioExec {
    Request(Arc<dyn RequestScenario>),
    Session(Arc<dyn SessionScenario>),
}

impl fmt::Debug for ScenarioExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(_) => f.write_str("Request(..)"),
            Self::Session(_) => f.write_str("Session(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: Arc<str>,
    pub weight: f64,
    pub exec: ScenarioExec,
    /// Bound on a request, or on opening a session.
    pub timeout: Duration,
}

impl ScenarioSpec {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn request(name: &str, weight: f64, scenario: impl RequestScenario + 'static) -> Self {
        Self {
            name: Arc::from(name),
            weight,
            exec: ScenarioExec::Request(Arc::new(scenario)),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn session(name: &str, weight: f64, scenario: impl SessionScenario + 'static) -> Self {
        Self {
            name: Arc::from(name),
            weight,
            exec: ScenarioExec::Session(Arc::new(scenario)),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
