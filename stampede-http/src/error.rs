use std::time::Duration;

use stampede_core::{ErrorKind, ScenarioFailure};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("http request build failed: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("invalid http header name: {0}")]
    HeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid http header value: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("http request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("http request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read response body: {0}")]
    BodyRead(#[from] hyper::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Classifies the error into the kind recorded on a failed outcome.
    #[must_use]
    pub fn transport_error_kind(&self) -> ErrorKind {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match self {
            Self::InvalidUrl(_)
            | Self::UnsupportedScheme(_)
            | Self::RequestBuild(_)
            | Self::HeaderName(_)
            | Self::HeaderValue(_) => ErrorKind::Other,
            Self::Request(e) if e.is_connect() => connect_kind(e),
            Self::Request(e) => {
                if io_kind(e) == Some(std::io::ErrorKind::TimedOut) {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Protocol
                }
            }
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::BodyRead(_) => ErrorKind::Protocol,
            Self::WebSocket(WsError::Io(e)) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Connect,
            },
            Self::WebSocket(WsError::Http(_)) => ErrorKind::Status,
            Self::WebSocket(WsError::Url(_)) => ErrorKind::Other,
            Self::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                ErrorKind::Closed
            }
            Self::WebSocket(_) => ErrorKind::Protocol,
        }
    }
}

impl From<Error> for ScenarioFailure {
    fn from(err: Error) -> Self {
        let failure = ScenarioFailure::new(err.transport_error_kind(), err.to_string());
        match &err {
            Error::WebSocket(tokio_tungstenite::tungstenite::Error::Http(res)) => {
                failure.with_tag("status", res.status().as_str())
            }
            _ => failure,
        }
    }
}

fn connect_kind(err: &hyper_util::client::legacy::Error) -> ErrorKind {
    match io_kind(err) {
        Some(std::io::ErrorKind::ConnectionRefused) => ErrorKind::ConnectionRefused,
        Some(std::io::ErrorKind::TimedOut) => ErrorKind::Timeout,
        _ => ErrorKind::Connect,
    }
}

/// First I/O error kind found in the source chain.
fn io_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        cur = e.source();
    }
    None
}
