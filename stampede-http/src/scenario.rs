use std::iter;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use stampede_core::{ErrorKind, RequestScenario, ScenarioContext, ScenarioFailure, Tags};

use crate::client::HttpClient;
use crate::template::{Captures, Template};
use crate::types::{HttpRequest, HttpResponse};
use crate::util::json_path;

/// Response body checks run after the status matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyCheck {
    /// The JSON body has a value at this dotted path.
    JsonField(String),
    /// The JSON value at this dotted path (the whole body when empty) is an array.
    JsonArray(String),
    /// The body contains this text.
    Contains(String),
    /// At least one of the checks passes.
    AnyOf(Vec<BodyCheck>),
    /// Every check passes.
    AllOf(Vec<BodyCheck>),
}

impl BodyCheck {
    fn verify(&self, res: &HttpResponse) -> Result<(), ScenarioFailure> {
        let failed = |message: String| {
            ScenarioFailure::new(ErrorKind::Parse, message).with_tag("status", res.status.to_string())
        };
        match self {
            Self::JsonField(path) => {
                let body = res
                    .json()
                    .ok_or_else(|| failed("response body is not JSON".to_string()))?;
                match json_path(&body, path) {
                    Some(v) if !v.is_null() => Ok(()),
                    _ => Err(failed(format!("response has no `{path}`"))),
                }
            }
            Self::JsonArray(path) => {
                let body = res
                    .json()
                    .ok_or_else(|| failed("response body is not JSON".to_string()))?;
                match json_path(&body, path) {
                    Some(v) if v.is_array() => Ok(()),
                    _ if path.is_empty() => Err(failed("response is not an array".to_string())),
                    _ => Err(failed(format!("`{path}` is not an array"))),
                }
            }
            Self::Contains(needle) => match res.body_utf8() {
                Some(text) if text.contains(needle.as_str()) => Ok(()),
                _ => Err(failed(format!("response does not contain `{needle}`"))),
            },
            Self::AnyOf(checks) => {
                let mut reasons = Vec::with_capacity(checks.len());
                for check in checks {
                    match check.verify(res) {
                        Ok(()) => return Ok(()),
                        Err(e) => reasons.push(e.message),
                    }
                }
                Err(failed(format!("no alternative matched: {}", reasons.join("; "))))
            }
            Self::AllOf(checks) => checks.iter().try_for_each(|check| check.verify(res)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    /// `Authorization: Bearer <token>` when setup stored a `token`.
    Bearer,
}

/// One request of an [`HttpScenario`], with the values it captures for later steps.
#[derive(Debug, Clone)]
pub struct HttpStep {
    method: http::Method,
    url: Template,
    headers: Vec<(String, Template)>,
    body: Option<Template>,
    expect_status: Vec<u16>,
    checks: Vec<BodyCheck>,
    auth: Auth,
    captures: Vec<(String, String)>,
}

impl HttpStep {
    pub fn new(method: http::Method, url: Template) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            expect_status: vec![200],
            checks: Vec::new(),
            auth: Auth::None,
            captures: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: Template) -> Self {
        self.headers.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Template) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn expect_status(mut self, statuses: Vec<u16>) -> Self {
        self.expect_status = statuses;
        self
    }

    #[must_use]
    pub fn check(mut self, check: BodyCheck) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// Stores the JSON value at `path` as `${name}` for the steps that follow.
    #[must_use]
    pub fn capture(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.captures.push((name.into(), path.into()));
        self
    }

    fn build_request(
        &self,
        ctx: &mut ScenarioContext,
        captures: &Captures,
    ) -> Result<HttpRequest, ScenarioFailure> {
        let mut req = HttpRequest::new(self.method.clone(), self.url.render_with(ctx, captures)?);
        for (name, value) in &self.headers {
            req.headers
                .push((name.clone(), value.render_with(ctx, captures)?));
        }
        if self.auth == Auth::Bearer
            && let Some(token) = ctx.data.get("token")
        {
            req.headers
                .push(("authorization".to_string(), format!("Bearer {token}")));
        }
        if let Some(body) = &self.body {
            req.body = Bytes::from(body.render_with(ctx, captures)?);
            if !crate::util::has_header(&req.headers, "content-type") {
                req.headers
                    .push(("content-type".to_string(), "application/json".to_string()));
            }
        }
        Ok(req)
    }

    fn verify(&self, res: &HttpResponse) -> Result<(), ScenarioFailure> {
        if !self.expect_status.contains(&res.status) {
            return Err(ScenarioFailure::new(
                ErrorKind::Status,
                format!("unexpected status {}", res.status),
            )
            .with_tag("status", res.status.to_string()));
        }
        self.checks.iter().try_for_each(|check| check.verify(res))
    }

    fn capture_into(
        &self,
        res: &HttpResponse,
        captures: &mut Captures,
    ) -> Result<(), ScenarioFailure> {
        if self.captures.is_empty() {
            return Ok(());
        }
        let failed = |message: String| {
            ScenarioFailure::new(ErrorKind::Parse, message).with_tag("status", res.status.to_string())
        };
        let body = res
            .json()
            .ok_or_else(|| failed("response body is not JSON".to_string()))?;
        for (name, path) in &self.captures {
            let value = match json_path(&body, path) {
                Some(Value::String(text)) => text.clone(),
                Some(Value::Null) | None => {
                    return Err(failed(format!("response has no `{path}` to capture as `{name}`")));
                }
                Some(other) => other.to_string(),
            };
            captures.insert(name.clone(), value);
        }
        Ok(())
    }
}

/// A request/response exchange against the system under test, optionally followed by
/// dependent requests that reuse values captured from earlier responses.
///
/// The builder methods configure the first request; [`HttpScenario::then`] appends more.
#[derive(Debug, Clone)]
pub struct HttpScenario {
    client: HttpClient,
    first: HttpStep,
    then: Vec<HttpStep>,
}

impl HttpScenario {
    pub fn new(client: HttpClient, method: http::Method, url: Template) -> Self {
        Self::from_step(client, HttpStep::new(method, url))
    }

    pub fn from_step(client: HttpClient, first: HttpStep) -> Self {
        Self {
            client,
            first,
            then: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: Template) -> Self {
        self.first = self.first.header(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: Template) -> Self {
        self.first = self.first.body(body);
        self
    }

    #[must_use]
    pub fn expect_status(mut self, statuses: Vec<u16>) -> Self {
        self.first = self.first.expect_status(statuses);
        self
    }

    #[must_use]
    pub fn check(mut self, check: BodyCheck) -> Self {
        self.first = self.first.check(check);
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: Auth) -> Self {
        self.first = self.first.auth(auth);
        self
    }

    #[must_use]
    pub fn capture(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.first = self.first.capture(name, path);
        self
    }

    /// Runs `step` after the previous one succeeded.
    #[must_use]
    pub fn then(mut self, step: HttpStep) -> Self {
        self.then.push(step);
        self
    }

    fn steps(&self) -> impl Iterator<Item = &HttpStep> {
        iter::once(&self.first).chain(&self.then)
    }
}

#[async_trait]
impl RequestScenario for HttpScenario {
    async fn execute(&self, ctx: &mut ScenarioContext) -> Result<Tags, ScenarioFailure> {
        let mut captures = Captures::new();
        let mut last = None;
        for step in self.steps() {
            let req = step.build_request(ctx, &captures)?;
            let res = self.client.request(req).await?;
            step.verify(&res)?;
            step.capture_into(&res, &mut captures)?;
            last = Some((step, res.status));
        }

        let mut tags = Tags::new();
        if let Some((step, status)) = last {
            tags.insert("status".to_string(), status.to_string());
            tags.insert("method".to_string(), step.method.to_string());
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &'static str) -> HttpResponse {
        HttpResponse {
            status,
            body: Bytes::from_static(body.as_bytes()),
            headers: Vec::new(),
        }
    }

    #[test]
    fn json_field_check() {
        let check = BodyCheck::JsonField("id".to_string());
        assert!(check.verify(&response(201, r#"{"id": 3}"#)).is_ok());
        assert!(check.verify(&response(201, r#"{"id": null}"#)).is_err());

        let err = check
            .verify(&response(200, "not json"))
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.tags.get("status").map(String::as_str), Some("200"));
    }

    #[test]
    fn json_array_check() {
        assert!(
            BodyCheck::JsonArray(String::new())
                .verify(&response(200, "[1, 2]"))
                .is_ok()
        );
        assert!(
            BodyCheck::JsonArray("items".to_string())
                .verify(&response(200, r#"{"items": []}"#))
                .is_ok()
        );
        assert!(
            BodyCheck::JsonArray("items".to_string())
                .verify(&response(200, r#"{"items": 3}"#))
                .is_err()
        );
    }

    #[test]
    fn contains_check() {
        let check = BodyCheck::Contains("# HELP".to_string());
        assert!(check.verify(&response(200, "# HELP up\nup 1\n")).is_ok());
        assert!(check.verify(&response(200, "up 1\n")).is_err());
    }

    #[test]
    fn any_of_passes_when_one_alternative_does() {
        let check = BodyCheck::AnyOf(vec![
            BodyCheck::JsonArray(String::new()),
            BodyCheck::JsonArray("items".to_string()),
        ]);
        assert!(check.verify(&response(200, "[]")).is_ok());
        assert!(check.verify(&response(200, r#"{"items": [1]}"#)).is_ok());

        let err = check
            .verify(&response(200, r#"{"items": 1}"#))
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.message.contains("`items` is not an array"), "{}", err.message);
    }

    #[test]
    fn all_of_needs_every_check() {
        let check = BodyCheck::AllOf(vec![
            BodyCheck::Contains("# HELP".to_string()),
            BodyCheck::Contains("# TYPE".to_string()),
        ]);
        assert!(check.verify(&response(200, "# HELP up\n# TYPE up gauge\n")).is_ok());
        assert!(check.verify(&response(200, "# HELP up\n")).is_err());
    }

    #[test]
    fn captures_take_strings_raw_and_other_values_as_json() {
        let step = HttpStep::new(
            http::Method::POST,
            Template::parse("/tasks").unwrap_or_else(|e| panic!("{e}")),
        )
        .capture("task_id", "id")
        .capture("owner", "owner.name");
        let mut captures = Captures::new();
        step.capture_into(
            &response(201, r#"{"id": 17, "owner": {"name": "ana"}}"#),
            &mut captures,
        )
        .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(captures.get("task_id").map(String::as_str), Some("17"));
        assert_eq!(captures.get("owner").map(String::as_str), Some("ana"));

        let err = step
            .capture_into(&response(201, r#"{"owner": {}}"#), &mut Captures::new())
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.tags.get("status").map(String::as_str), Some("201"));
    }
}
