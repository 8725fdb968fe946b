#![forbid(unsafe_code)]

mod client;
mod error;
mod hooks;
mod scenario;
mod template;
mod types;
mod util;
mod ws;

pub use client::HttpClient;
pub use error::{Error, Result};
pub use hooks::{HealthHook, LoginHook, ReachabilityHook};
pub use scenario::{Auth, BodyCheck, HttpScenario, HttpStep};
pub use template::{Captures, Template, TemplateError};
pub use types::{HttpRequest, HttpResponse};
pub use util::join_url;
pub use ws::{AckMatcher, WsScenario};
