//! Fan-out provider client: one answer from one backend for one query.
//!
//! Epistemic foundation:
//! - K_i: Each protocol family has its own auth header, body shape and grammar
//! - B_i: API will respond within timeout (might fail)
//! - B_i: A 200 response carries a stream (might be an error envelope instead)
//! - I^B: Network availability unknowable → failure becomes the answer text
//!
//! Nothing raised here crosses the `fetch_answer` boundary: every failure is
//! rendered into a descriptive string so sibling queries are unaffected.

use crate::client::stream::{StreamGrammar, extract_stream_content};
use crate::client::{ConcurrencyGate, CredentialStore, ModelCatalog, header_override};
use crate::models::{
    EvalmuxError, FetchError, ModelDescriptor, ProgressObserver, ProtocolFamily, RequestTemplate,
    Result, expand_headers,
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Placeholder answer when a chat stream carried no content.
pub const EMPTY_CHAT_ANSWER: &str = "No valid content returned";
/// Placeholder answer when an instruction stream carried no content.
pub const EMPTY_INSTRUCTION_ANSWER: &str =
    "Empty API response; check that the cookie is still valid";

/// Shared per-dispatch state handed to every fetch.
pub struct FetchContext<'a> {
    /// Concurrency gate of the current dispatch call
    pub gate: &'a ConcurrencyGate,
    /// Progress sink, incremented on each completed fetch
    pub observer: &'a dyn ProgressObserver,
    /// Caller-supplied headers that may carry credential overrides
    pub overrides: &'a HeaderMap,
}

/// Source of answers for the dispatcher.
#[async_trait]
pub trait AnswerFetcher: Send + Sync {
    /// Answer `query` with `model`. Never fails: errors come back as text.
    async fn fetch_answer(&self, query: &str, model: &str, ctx: &FetchContext<'_>) -> String;
}

/// Success-status body that is an error object rather than a stream.
#[derive(Debug, Deserialize)]
struct SoftErrorEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
}

/// HTTP client for the fan-out protocol families.
pub struct ProviderClient {
    client: reqwest::Client,
    catalog: Arc<ModelCatalog>,
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl ProviderClient {
    /// Create a new provider client.
    ///
    /// # Arguments
    /// - `catalog`: Registry used to resolve model names
    /// - `credentials`: Secret store consulted per request
    /// - `timeout_secs`: Per-request timeout in seconds
    /// - `per_host_limit`: Idle connections kept per host
    pub fn new(
        catalog: Arc<ModelCatalog>,
        credentials: Arc<dyn CredentialStore>,
        timeout_secs: u64,
        per_host_limit: usize,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(per_host_limit)
            .build()
            .map_err(EvalmuxError::Network)?;

        Ok(Self {
            client,
            catalog,
            credentials,
            timeout,
        })
    }

    /// Get the catalog.
    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Credential for `descriptor`, from the store or a per-request override.
    ///
    /// Only chat-stream backends accept header overrides.
    fn resolve_credential(
        &self,
        descriptor: &ModelDescriptor,
        overrides: &HeaderMap,
    ) -> std::result::Result<String, FetchError> {
        self.credentials
            .get(&descriptor.credential_key)
            .or_else(|| match descriptor.family {
                ProtocolFamily::EventStream => {
                    header_override(overrides, descriptor.upstream_model())
                }
                _ => None,
            })
            .ok_or_else(|| FetchError::MissingCredential {
                credential_key: descriptor.credential_key.clone(),
            })
    }

    /// Build headers for a request.
    fn headers(&self, descriptor: &ModelDescriptor, credential: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (key, value) in expand_headers(&descriptor.headers) {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, val);
            }
        }

        let auth = if descriptor.family == ProtocolFamily::DeltaStream {
            HeaderValue::from_str(credential).map(|v| (COOKIE, v))
        } else {
            HeaderValue::from_str(&format!("Bearer {credential}")).map(|v| (AUTHORIZATION, v))
        };
        match auth {
            Ok((name, value)) => {
                headers.insert(name, value);
            }
            Err(_) => warn!(model = %descriptor.name, "Credential is not a valid header value"),
        }

        headers
    }

    async fn fetch(
        &self,
        query: &str,
        descriptor: &ModelDescriptor,
        template: &RequestTemplate,
        ctx: &FetchContext<'_>,
    ) -> std::result::Result<String, FetchError> {
        let credential = self.resolve_credential(descriptor, ctx.overrides)?;
        let headers = self.headers(descriptor, &credential);
        let body = build_body(template, descriptor.upstream_model(), query);
        let url = descriptor.endpoint_url();

        let _permit = ctx.gate.acquire(&descriptor.host()).await?;
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::from_transport(e, self.timeout))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| FetchError::from_transport(e, self.timeout))?;

        debug!(
            model = %descriptor.name,
            status = status.as_u16(),
            bytes = raw.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Backend responded"
        );

        if !status.is_success() {
            return Err(status_error(descriptor, status.as_u16()));
        }

        if let Some(err) = detect_soft_error(&raw) {
            return Err(err);
        }

        let content = match StreamGrammar::for_family(descriptor.family) {
            Some(grammar) => extract_stream_content(grammar, raw.lines()),
            None => raw,
        };

        ctx.observer.increment();

        if content.trim().is_empty() {
            Ok(empty_placeholder(descriptor.family).to_string())
        } else {
            Ok(content)
        }
    }
}

#[async_trait]
impl AnswerFetcher for ProviderClient {
    async fn fetch_answer(&self, query: &str, model: &str, ctx: &FetchContext<'_>) -> String {
        // Judge-family backends have no fan-out body template.
        let Some((descriptor, template)) = self
            .catalog
            .resolve(model)
            .filter(|d| d.family.is_fan_out())
            .and_then(|d| Some((d, d.request_template()?)))
        else {
            return FetchError::UnsupportedModel(model.to_string()).to_string();
        };

        match self.fetch(query, descriptor, &template, ctx).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(model = %model, error = %err, "Fetch failed");
                err.to_string()
            }
        }
    }
}

/// Request body for `template` with `query` substituted.
pub fn build_body(template: &RequestTemplate, model_id: &str, query: &str) -> Value {
    match template {
        RequestTemplate::ChatStream { web_search } => json!({
            "model": model_id,
            "features": { "web_search": web_search },
            "query": query,
            "chat_id": Uuid::new_v4().to_string(),
        }),
        RequestTemplate::Instruction {
            key,
            stream,
            parameters,
        } => {
            let parameters: Vec<Value> = parameters
                .iter()
                .map(|slot| json!({ "key": slot.key, "value": slot.render(query) }))
                .collect();
            json!({
                "key": key,
                "parameters": parameters,
                "model": model_id,
                "stream": stream,
            })
        }
    }
}

fn status_error(descriptor: &ModelDescriptor, status: u16) -> FetchError {
    match (descriptor.family, status) {
        (ProtocolFamily::DeltaStream, 401) => FetchError::CookieRejected {
            credential_key: descriptor.credential_key.clone(),
        },
        (ProtocolFamily::DeltaStream, 403) => FetchError::AccessDenied,
        _ => FetchError::Http { status },
    }
}

/// Error object delivered with a success status, if `raw` is one.
fn detect_soft_error(raw: &str) -> Option<FetchError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let envelope: SoftErrorEnvelope = serde_json::from_str(trimmed).ok()?;
    let err = if envelope.code == 401 {
        FetchError::AuthExpired {
            message: envelope.msg.unwrap_or_else(|| "Unauthorized".to_string()),
        }
    } else {
        FetchError::Api {
            message: envelope
                .msg
                .unwrap_or_else(|| format!("code {}", envelope.code)),
        }
    };
    Some(err)
}

fn empty_placeholder(family: ProtocolFamily) -> &'static str {
    match family {
        ProtocolFamily::DeltaStream => EMPTY_INSTRUCTION_ANSWER,
        _ => EMPTY_CHAT_ANSWER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParameterSlot;

    #[test]
    fn instruction_body_substitutes_prompt_slot_in_order() {
        let template = RequestTemplate::Instruction {
            key: "common_writing".into(),
            stream: true,
            parameters: vec![
                ParameterSlot::new("user_instruction", "{prompt}"),
                ParameterSlot::new("with_search", "false"),
            ],
        };
        let body = build_body(&template, "HKGAI-V1", "介绍深度学习");
        assert_eq!(
            body,
            json!({
                "key": "common_writing",
                "parameters": [
                    {"key": "user_instruction", "value": "介绍深度学习"},
                    {"key": "with_search", "value": "false"},
                ],
                "model": "HKGAI-V1",
                "stream": true,
            })
        );
    }

    #[test]
    fn chat_body_carries_fresh_chat_id() {
        let template = RequestTemplate::ChatStream { web_search: false };
        let a = build_body(&template, "HKGAI-V2", "q");
        let b = build_body(&template, "HKGAI-V2", "q");
        assert_eq!(a["query"], "q");
        assert_eq!(a["features"]["web_search"], false);
        assert_ne!(a["chat_id"], b["chat_id"]);
    }

    #[test]
    fn soft_error_detection() {
        assert!(matches!(
            detect_soft_error(r#"{"code":401,"msg":"token expired"}"#),
            Some(FetchError::AuthExpired { message }) if message == "token expired"
        ));
        assert!(matches!(
            detect_soft_error(r#" {"code":500} "#),
            Some(FetchError::Api { message }) if message == "code 500"
        ));
        assert!(detect_soft_error("event:APPEND\ndata:{}").is_none());
        assert!(detect_soft_error(r#"{"choices":[]}"#).is_none());
    }

    #[test]
    fn status_errors_by_family() {
        let delta = ModelDescriptor::delta_stream("d", "http://h/x", "D", "COOKIE_X");
        let chat = ModelDescriptor::event_stream("c", "http://h/y", "KEY_Y");
        assert_eq!(
            status_error(&delta, 401).to_string(),
            "Cookie authentication failed: update the COOKIE_X cookie"
        );
        assert!(matches!(status_error(&delta, 403), FetchError::AccessDenied));
        assert_eq!(status_error(&chat, 401).to_string(), "Request failed: HTTP 401");
    }
}
