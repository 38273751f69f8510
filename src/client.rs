//! Blocking client for the texture generation endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::error::{ErrorClass, ErrorRecord, PipelineResult};
use crate::protocol::{
    DEFAULT_ENDPOINT, DEFAULT_TIMEOUT_SECS, GenerationRequest, GenerationResult, MapKind,
    MapSelection, ResponseEnvelope,
};

/// Raw status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// The one network operation the pipeline needs.
///
/// Implementations return `Err` only for transport failures (no response at all); any
/// status code, including 4xx/5xx, is a successful exchange.
pub trait HttpTransport: Send + Sync {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: String,
        timeout: Duration,
    ) -> PipelineResult<HttpResponse>;
}

/// Production transport over `reqwest::blocking`.
#[derive(Debug, Clone)]
pub struct BlockingHttpTransport {
    client: reqwest::blocking::Client,
}

impl BlockingHttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("pbr-map-forge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for BlockingHttpTransport {
    fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: String,
        timeout: Duration,
    ) -> PipelineResult<HttpResponse> {
        let resp = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header(CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .map_err(|e| ErrorRecord::network(format!("API request failed: {e}")))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| ErrorRecord::network(format!("Failed to read API response: {e}")))?;
        Ok(HttpResponse { status, body })
    }
}

/// Key preview safe for logs: first and last four characters only.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[derive(Clone)]
pub struct GenerationClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
    timeout: Duration,
}

impl GenerationClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one generation request. Never retries.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        api_key: &str,
    ) -> PipelineResult<GenerationResult> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ErrorRecord::new(
                ErrorClass::HttpUnauthorized,
                "No API key configured.",
            ));
        }
        if request.kinds.is_empty() {
            return Err(ErrorRecord::new(
                ErrorClass::HttpBadRequest,
                "No texture types selected.",
            ));
        }

        let body = serde_json::to_string(&request.to_body())
            .map_err(|e| ErrorRecord::unexpected(format!("Failed to encode request: {e}")))?;
        let kinds: Vec<&str> = request.kinds.iter().map(|k| k.as_str()).collect();
        debug!(
            url = %self.endpoint,
            key_len = api_key.len(),
            key = %mask_api_key(api_key),
            image_bytes = request.payload.len(),
            body_bytes = body.len(),
            texture_types = ?kinds,
            "sending generation request"
        );

        let response = self
            .transport
            .post_json(&self.endpoint, api_key, body, self.timeout)?;
        debug!(status = response.status, "generation response received");
        classify_response(response.status, &response.body, &request.kinds)
    }
}

/// Turn a status and body into a result; the class of a failure depends on `status` only.
pub fn classify_response(
    status: u16,
    body: &str,
    requested: &MapSelection,
) -> PipelineResult<GenerationResult> {
    if !(200..300).contains(&status) {
        let message = http_error_message(status, body);
        warn!(status, %message, "generation request rejected");
        return Err(ErrorRecord::new(ErrorClass::from_status(status), message).with_code(status));
    }

    let envelope: ResponseEnvelope = serde_json::from_str(body).map_err(|e| {
        debug!(body = %truncate(body, 500), "unparseable response body");
        ErrorRecord::decode(format!("Failed to parse API response: {e}")).with_code(status)
    })?;

    if envelope.success != Some(true) {
        let message = envelope
            .message_text()
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(%message, "service reported failure");
        return Err(
            ErrorRecord::new(ErrorClass::Application, format!("API returned error: {message}"))
                .with_code(status),
        );
    }

    let textures = match envelope.textures {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            return Err(
                ErrorRecord::decode("API response field 'textures' is not an object")
                    .with_code(status),
            );
        }
        None => {
            return Err(ErrorRecord::decode("API response has no 'textures'").with_code(status));
        }
    };

    let mut result = GenerationResult {
        textures: Default::default(),
        metadata: envelope.metadata,
        usage: envelope.usage,
    };
    for (key, value) in textures {
        let Ok(kind) = key.parse::<MapKind>() else {
            warn!(kind = %key, "ignoring unsupported texture kind in response");
            continue;
        };
        if !requested.contains(&kind) {
            warn!(%kind, "ignoring texture kind that was not requested");
            continue;
        }
        let Some(data) = value.as_str() else {
            return Err(
                ErrorRecord::decode(format!("Texture '{key}' in API response is not a string"))
                    .with_code(status),
            );
        };
        result.textures.insert(kind, data.to_string());
    }

    let received: Vec<&str> = result.textures.keys().map(|k| k.as_str()).collect();
    info!(textures = ?received, "received generated textures");
    if let Some(metadata) = &result.metadata {
        debug!(%metadata, "response metadata");
    }
    if let Some(usage) = &result.usage {
        info!(%usage, "usage");
    }
    Ok(result)
}

fn http_error_message(status: u16, body: &str) -> String {
    let fallback = || format!("HTTP {status}: {}", truncate(body, 500));
    let Ok(envelope) = serde_json::from_str::<ResponseEnvelope>(body) else {
        return fallback();
    };
    if let Some(info) = &envelope.debug {
        debug!(%info, "server debug info");
    }
    match (envelope.error_text(), envelope.message_text()) {
        (Some(error), Some(message)) => format!("{error}: {message}"),
        (None, Some(message)) => format!("API error: {message}"),
        (Some(error), None) => error,
        (None, None) => fallback(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
