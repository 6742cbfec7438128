// HTTP-backed action executor
//
// `HTTP_REQUEST` and `WEBHOOK` steps call the configured URL directly.
// Notify, publish and AI generation are forwarded to the integration layer
// at `INTEGRATIONS_URL`. A non-2xx answer from a step's own URL is a step
// result; failing to reach a host is an infrastructure fault.

use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{ActionError, ActionExecutor, ActionOutcome};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Input keys consumed by the executor itself rather than sent as payload
const RESERVED_KEYS: [&str; 4] = ["url", "method", "headers", "secret"];

/// Action executor over reqwest
#[derive(Clone)]
pub struct HttpActionExecutor {
    client: Client,
    integrations_url: String,
}

impl HttpActionExecutor {
    pub fn new(integrations_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("conveyor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, integrations_url))
    }

    pub fn with_client(client: Client, integrations_url: impl Into<String>) -> Self {
        Self {
            client,
            integrations_url: integrations_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, Value), ActionError> {
        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Unavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Unavailable(format!("failed to read response body: {}", e)))?;
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));
        Ok((status, body))
    }

    /// Forward an action to the integration layer
    async fn call_integration(
        &self,
        path: &str,
        input: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let url = format!("{}/{}", self.integrations_url, path);
        debug!(%url, "calling integration layer");

        let (status, body) = self.send(self.client.post(&url).json(&payload(input))).await?;
        if status.is_server_error() {
            warn!(%url, %status, "integration layer error");
            return Err(ActionError::Unavailable(format!(
                "integration layer returned {}",
                status
            )));
        }
        Ok(outcome(status, body))
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn http_request(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        let Some(url) = str_field(input, "url") else {
            return Ok(ActionOutcome::failed("HTTP_REQUEST step has no url"));
        };
        let method = match str_field(input, "method").unwrap_or("GET").to_uppercase().parse::<Method>() {
            Ok(method) => method,
            Err(_) => return Ok(ActionOutcome::failed("HTTP_REQUEST step has an invalid method")),
        };

        let mut request = with_headers(self.client.request(method, url), input);
        if let Some(body) = input.get("body").filter(|b| !b.is_null()) {
            request = request.json(body);
        }

        let (status, body) = self.send(request).await?;
        Ok(outcome(status, body))
    }

    async fn webhook(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        let Some(url) = str_field(input, "url") else {
            return Ok(ActionOutcome::failed("WEBHOOK step has no url"));
        };

        let body = input.get("body").cloned().unwrap_or_else(|| payload(input));
        let body = serde_json::to_string(&body)
            .map_err(|e| ActionError::Unavailable(format!("failed to encode webhook body: {}", e)))?;

        let mut request = with_headers(self.client.post(url), input)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = str_field(input, "secret") {
            request = request.header(SIGNATURE_HEADER, sign(&body, secret));
        }

        let (status, response) = self.send(request.body(body)).await?;
        Ok(outcome(status, response))
    }

    async fn notify_user(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        self.call_integration("notify", input).await
    }

    async fn publish_content(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        self.call_integration("publish", input).await
    }

    async fn ai_generate(&self, input: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        self.call_integration("ai/generate", input).await
    }
}

fn str_field<'a>(input: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// The input without executor-only keys
fn payload(input: &Map<String, Value>) -> Value {
    Value::Object(
        input
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn with_headers(mut request: RequestBuilder, input: &Map<String, Value>) -> RequestBuilder {
    if let Some(headers) = input.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(name.as_str(), value);
            }
        }
    }
    request
}

fn outcome(status: StatusCode, body: Value) -> ActionOutcome {
    let output = json!({ "status": status.as_u16(), "body": body });
    if status.is_success() {
        ActionOutcome::ok(output)
    } else {
        ActionOutcome {
            success: false,
            output: Some(output),
            error: Some(format!("request returned {}", status)),
        }
    }
}

/// SHA-256 signature over secret and body
fn sign(body: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body.as_bytes());
    format!("sha256={}", hex::encode(hasher.finalize()))
}
