use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stampede_core::{Hook, RunData, SetupFailure};

use crate::client::HttpClient;
use crate::types::HttpRequest;
use crate::util::json_path;

/// Opens (and drops) a TCP connection to the target.
#[derive(Debug, Clone)]
pub struct ReachabilityHook {
    url: url::Url,
    timeout: Duration,
}

impl ReachabilityHook {
    pub fn new(target: &str, timeout: Duration) -> Result<Self, crate::Error> {
        let url = url::Url::parse(target).map_err(|_| crate::Error::InvalidUrl(target.to_string()))?;
        if url.host_str().is_none() {
            return Err(crate::Error::InvalidUrl(target.to_string()));
        }
        Ok(Self { url, timeout })
    }

    fn authority(&self) -> Option<(String, u16)> {
        let host = self.url.host_str()?.trim_matches(['[', ']']).to_string();
        let port = self.url.port_or_known_default()?;
        Some((host, port))
    }
}

#[async_trait]
impl Hook for ReachabilityHook {
    fn name(&self) -> &str {
        "reachability"
    }

    async fn run(&self, _data: &mut RunData) -> Result<(), SetupFailure> {
        let (host, port) = self
            .authority()
            .ok_or_else(|| SetupFailure::hook(self.name(), format!("no address in {}", self.url)))?;
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((host.as_str(), port)))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SetupFailure::hook(
                self.name(),
                format!("cannot connect to {host}:{port}: {e}"),
            )),
            Err(_) => Err(SetupFailure::hook(
                self.name(),
                format!("connect to {host}:{port} timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// GETs a URL and expects one of the given statuses.
#[derive(Debug, Clone)]
pub struct HealthHook {
    client: HttpClient,
    url: String,
    expect_status: Vec<u16>,
    timeout: Duration,
}

impl HealthHook {
    pub fn new(client: HttpClient, url: String, timeout: Duration) -> Self {
        Self {
            client,
            url,
            expect_status: vec![200],
            timeout,
        }
    }

    #[must_use]
    pub fn expect_status(mut self, statuses: Vec<u16>) -> Self {
        self.expect_status = statuses;
        self
    }
}

#[async_trait]
impl Hook for HealthHook {
    fn name(&self) -> &str {
        "health"
    }

    async fn run(&self, _data: &mut RunData) -> Result<(), SetupFailure> {
        let req = HttpRequest::get(&self.url).with_timeout(self.timeout);
        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| SetupFailure::hook(self.name(), e.to_string()))?;
        if !self.expect_status.contains(&res.status) {
            return Err(SetupFailure::hook(
                self.name(),
                format!("{} answered {}", self.url, res.status),
            ));
        }
        tracing::info!(url = %self.url, status = res.status, "health check passed");
        Ok(())
    }
}

/// POSTs credentials and stores the returned token in run data as `token`.
#[derive(Debug, Clone)]
pub struct LoginHook {
    client: HttpClient,
    url: String,
    credentials: Value,
    token_field: String,
    allow_anonymous: bool,
    timeout: Duration,
}

impl LoginHook {
    pub const TOKEN_KEY: &'static str = "token";

    pub fn new(client: HttpClient, url: String, credentials: Value, timeout: Duration) -> Self {
        Self {
            client,
            url,
            credentials,
            token_field: "access_token".to_string(),
            allow_anonymous: false,
            timeout,
        }
    }

    #[must_use]
    pub fn token_field(mut self, field: impl Into<String>) -> Self {
        self.token_field = field.into();
        self
    }

    /// Continue without a token when login fails.
    #[must_use]
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    async fn login(&self) -> Result<String, String> {
        let req = HttpRequest::post_json(&self.url, &self.credentials).with_timeout(self.timeout);
        let res = self.client.request(req).await.map_err(|e| e.to_string())?;
        if res.status != 200 {
            return Err(format!("{} answered {}", self.url, res.status));
        }
        let body = res
            .json()
            .ok_or_else(|| "login response is not JSON".to_string())?;
        json_path(&body, &self.token_field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("login response has no `{}`", self.token_field))
    }
}

#[async_trait]
impl Hook for LoginHook {
    fn name(&self) -> &str {
        "login"
    }

    async fn run(&self, data: &mut RunData) -> Result<(), SetupFailure> {
        match self.login().await {
            Ok(token) => {
                data.insert(Self::TOKEN_KEY, token);
                Ok(())
            }
            Err(message) if self.allow_anonymous => {
                tracing::warn!(%message, "login failed; continuing without a token");
                Ok(())
            }
            Err(message) => Err(SetupFailure::hook(self.name(), message)),
        }
    }
}
