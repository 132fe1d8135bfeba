use std::io::Read;
use std::time::Duration;

use relay_contracts::conversation::ConversationTurn;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{RelayError, RelayResult};

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Edit,
    Enhance,
    Generate,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Edit => "edit",
            Endpoint::Enhance => "enhance",
            Endpoint::Generate => "generate",
        }
    }
}

/// Body shared by every proxy endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ConversationTurn>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

impl ProxyRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, data_uri: String) -> Self {
        self.image = Some(data_uri);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_messages(mut self, messages: &[ConversationTurn]) -> Self {
        self.messages = Some(messages.to_vec());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn to_value(&self) -> RelayResult<Value> {
        serde_json::to_value(self)
            .map_err(|err| RelayError::InvalidInput(format!("request body not serializable: {err}")))
    }
}

/// Seam between the session and the proxy. The HTTP implementation is the
/// production one; tests plug in scripted fakes.
pub trait ProxyTransport: Send {
    fn post_json(&self, endpoint: Endpoint, body: &Value) -> RelayResult<Value>;

    /// Opens a streamed response and hands back its raw body.
    fn post_stream(&self, endpoint: Endpoint, body: &Value) -> RelayResult<Box<dyn Read + Send>>;
}

pub struct HttpTransport {
    base: String,
    http: HttpClient,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            timeout: None,
        }
    }

    /// Bounds non-streaming calls. Streams are bounded by the caller's
    /// cancel token instead.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/api/{}", self.base, endpoint.as_str())
    }
}

impl ProxyTransport for HttpTransport {
    fn post_json(&self, endpoint: Endpoint, body: &Value) -> RelayResult<Value> {
        let url = self.url(endpoint);
        debug!(%url, "posting to proxy");
        let mut request = self.http.post(&url).json(body);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request.send()?;
        response_json_or_error(response)
    }

    fn post_stream(&self, endpoint: Endpoint, body: &Value) -> RelayResult<Box<dyn Read + Send>> {
        let url = self.url(endpoint);
        debug!(%url, "opening proxy stream");
        let response = self
            .http
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text()?;
            return Err(RelayError::UpstreamHttpError {
                status: status.as_u16(),
                message: error_message_from_body(&body, status.canonical_reason()),
            });
        }
        Ok(Box::new(response))
    }
}

fn response_json_or_error(response: HttpResponse) -> RelayResult<Value> {
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(RelayError::UpstreamHttpError {
            status: status.as_u16(),
            message: error_message_from_body(&body, status.canonical_reason()),
        });
    }
    serde_json::from_str(&body).map_err(|err| {
        RelayError::UnrecognizedResponseShape(format!(
            "proxy returned invalid JSON ({err}): {}",
            truncate_text(&body, ERROR_BODY_MAX_CHARS)
        ))
    })
}

/// Picks the most specific message out of an error body: `error.message`,
/// then an `error` or `message` string, then the raw text.
fn error_message_from_body(body: &str, fallback: Option<&str>) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let structured = parsed
            .pointer("/error/message")
            .and_then(Value::as_str)
            .or_else(|| parsed.get("error").and_then(Value::as_str))
            .or_else(|| parsed.get("message").and_then(Value::as_str))
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(message) = structured {
            return truncate_text(message, ERROR_BODY_MAX_CHARS);
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return fallback.unwrap_or("no response body").to_string();
    }
    truncate_text(trimmed, ERROR_BODY_MAX_CHARS)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
