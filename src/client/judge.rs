//! Reliable judge client.
//!
//! Epistemic foundation:
//! - K_i: One REST call per attempt, bounded number of attempts
//! - B_i: The judge replies with structured text (might be filtered or truncated)
//! - I^B: Rate limits and outages unknowable → backoff, then synthesize
//!
//! The caller always receives text. When every attempt fails the text is a
//! synthesized default judgment giving each participant a neutral score,
//! unless the last reply was unstructured prose, which is returned as-is.

use crate::client::{CredentialStore, ModelCatalog};
use crate::models::{
    EvalmuxError, JudgeConfig, JudgeFailure, LabelStyle, ModelDescriptor, Result,
};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static PARTICIPANT_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:model|模型)\s*[_-]?\s*(\d+)").expect("valid regex")
});

/// Participants assumed when the prompt names none.
pub const DEFAULT_PARTICIPANTS: usize = 2;
/// Indices above this are treated as incidental numbers, not participants.
const MAX_PARTICIPANTS: usize = 64;

const FORMAT_NOTE: &str = "\n\nRespond only with the JSON object described above, with no other text.";
const STRICT_FORMAT_NOTE: &str = "\n\nIMPORTANT: the previous reply was not valid JSON. Output exactly one JSON object, starting with { and ending with }, and nothing else.";

/// Something that turns an evaluation prompt into judge text.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    /// Judge `prompt`. Never fails: exhausted retries yield the last prose reply or a synthesized judgment.
    async fn judge(&self, prompt: &str) -> String;

    /// Score used when a judgment has to be synthesized.
    fn neutral_score(&self) -> i64 {
        3
    }
}

/// generateContent request payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_k: u32,
    top_p: f64,
    max_output_tokens: u32,
}

/// generateContent response envelope.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Why the judge finished generating.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FinishReason {
    Stop,
    Safety,
    MaxTokens,
    Other(String),
}

impl FinishReason {
    fn parse(reason: Option<&str>) -> Self {
        match reason {
            None | Some("STOP") => Self::Stop,
            Some("SAFETY") => Self::Safety,
            Some("MAX_TOKENS") => Self::MaxTokens,
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

/// Extra instruction appended to the prompt before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reinforcement {
    Format,
    StrictFormat,
}

impl Reinforcement {
    fn note(self) -> &'static str {
        match self {
            Self::Format => FORMAT_NOTE,
            Self::StrictFormat => STRICT_FORMAT_NOTE,
        }
    }
}

/// What one attempt decided.
#[derive(Debug)]
enum AttemptOutcome {
    /// Text to hand back to the caller
    Done(String),
    /// Try again after `delay`, optionally reinforcing the prompt
    Retry {
        failure: JudgeFailure,
        delay: Duration,
        reinforce: Option<Reinforcement>,
    },
    /// Stop retrying and synthesize a default judgment
    Synthesize(JudgeFailure),
}

/// Retry state carried across attempts.
#[derive(Debug, Default)]
pub struct RetryState {
    /// 1-based number of the attempt in progress
    pub attempt: u32,
    /// Most recent failure
    pub last_error: Option<JudgeFailure>,
    applied: Vec<Reinforcement>,
}

impl RetryState {
    fn reinforce(&mut self, prompt: &mut String, reinforcement: Reinforcement) {
        if !self.applied.contains(&reinforcement) {
            prompt.push_str(reinforcement.note());
            self.applied.push(reinforcement);
        }
    }
}

/// Judge client with bounded retries and default-judgment synthesis.
pub struct ReliableJudgeClient {
    client: reqwest::Client,
    descriptor: ModelDescriptor,
    credentials: Arc<dyn CredentialStore>,
    config: JudgeConfig,
    timeout: Duration,
}

impl ReliableJudgeClient {
    /// Create a new judge client for `descriptor`.
    pub fn new(
        descriptor: ModelDescriptor,
        credentials: Arc<dyn CredentialStore>,
        config: JudgeConfig,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EvalmuxError::Network)?;

        Ok(Self {
            client,
            descriptor,
            credentials,
            config,
            timeout,
        })
    }

    /// Create a judge client for the catalog entry named by `config.model`.
    pub fn from_catalog(
        catalog: &ModelCatalog,
        credentials: Arc<dyn CredentialStore>,
        config: JudgeConfig,
    ) -> Result<Self> {
        let descriptor = catalog
            .resolve(&config.model)
            .cloned()
            .ok_or_else(|| EvalmuxError::UnsupportedModel(config.model.clone()))?;
        Self::new(descriptor, credentials, config)
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Build headers for a request.
    fn headers(&self, api_key: &str) -> std::result::Result<HeaderMap, JudgeFailure> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in crate::models::expand_headers(&self.descriptor.headers) {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, val);
            }
        }
        let key = HeaderValue::from_str(api_key).map_err(|_| {
            JudgeFailure::MissingCredential(self.descriptor.credential_key.clone())
        })?;
        headers.insert(HeaderName::from_static("x-goog-api-key"), key);
        Ok(headers)
    }

    fn request<'a>(&self, prompt: &'a str) -> GenerateRequest<'a> {
        GenerateRequest {
            contents: [Content {
                parts: [TextPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_k: self.config.top_k,
                top_p: self.config.top_p,
                max_output_tokens: self.config.max_output_tokens,
            },
        }
    }

    fn fixed_delay(&self) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
    }

    /// One REST call, classified into an outcome.
    async fn attempt(&self, prompt: &str, headers: &HeaderMap, attempt: u32) -> AttemptOutcome {
        let start = Instant::now();
        let response = self
            .client
            .post(self.descriptor.endpoint_url())
            .headers(headers.clone())
            .json(&self.request(prompt))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return AttemptOutcome::Retry {
                    failure: JudgeFailure::from_transport(e, self.timeout),
                    delay: self.fixed_delay(),
                    reinforce: None,
                };
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::Retry {
                    failure: JudgeFailure::from_transport(e, self.timeout),
                    delay: self.fixed_delay(),
                    reinforce: None,
                };
            }
        };

        debug!(
            attempt = attempt,
            status = status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Judge responded"
        );

        match status {
            200 => classify_envelope(&body, self.fixed_delay()),
            429 => AttemptOutcome::Retry {
                failure: JudgeFailure::RateLimited,
                delay: self.backoff_delay(attempt),
                reinforce: None,
            },
            400 => AttemptOutcome::Synthesize(JudgeFailure::BadRequest(truncate(&body, 200))),
            status => AttemptOutcome::Retry {
                failure: JudgeFailure::Http { status },
                delay: self.fixed_delay(),
                reinforce: None,
            },
        }
    }

    /// Run the retry loop and report the final text.
    ///
    /// Attempting → Success
    /// Attempting → RetryableFailure → Attempting
    /// Attempting → TerminalFailure → DefaultSynthesis → Success
    pub async fn judge_text(&self, prompt: &str) -> String {
        let Some(api_key) = self.credentials.get(&self.descriptor.credential_key) else {
            let failure = JudgeFailure::MissingCredential(self.descriptor.credential_key.clone());
            warn!(error = %failure, "Judge unavailable, synthesizing default judgment");
            return synthesize_default_judgment(prompt, self.config.neutral_score);
        };
        let headers = match self.headers(&api_key) {
            Ok(h) => h,
            Err(failure) => {
                warn!(error = %failure, "Judge unavailable, synthesizing default judgment");
                return synthesize_default_judgment(prompt, self.config.neutral_score);
            }
        };

        let max_attempts = self.max_attempts();
        let mut working_prompt = prompt.to_string();
        let mut state = RetryState::default();

        for attempt in 1..=max_attempts {
            state.attempt = attempt;

            match self.attempt(&working_prompt, &headers, attempt).await {
                AttemptOutcome::Done(text) => {
                    if attempt > 1 {
                        info!(attempt = attempt, "Judge succeeded after retry");
                    }
                    return text;
                }
                AttemptOutcome::Synthesize(failure) => {
                    warn!(attempt = attempt, error = %failure, "Judge failed terminally");
                    state.last_error = Some(failure);
                    break;
                }
                AttemptOutcome::Retry {
                    failure,
                    delay,
                    reinforce,
                } => {
                    let exhausted = attempt >= max_attempts;
                    if exhausted {
                        warn!(attempt = attempt, error = %failure, "Judge attempts exhausted");
                        match &failure {
                            JudgeFailure::SafetyFiltered => return failure.to_string(),
                            JudgeFailure::Unstructured { text } if !text.trim().is_empty() => {
                                return text.clone();
                            }
                            _ => {}
                        }
                        state.last_error = Some(failure);
                        break;
                    }

                    debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Retrying judge call"
                    );
                    if let Some(r) = reinforce {
                        state.reinforce(&mut working_prompt, r);
                    }
                    state.last_error = Some(failure);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        debug!(
            attempts = state.attempt,
            last_error = ?state.last_error.as_ref().map(|e| e.to_string()),
            "Synthesizing default judgment"
        );
        synthesize_default_judgment(prompt, self.config.neutral_score)
    }
}

#[async_trait]
impl JudgeBackend for ReliableJudgeClient {
    async fn judge(&self, prompt: &str) -> String {
        self.judge_text(prompt).await
    }

    fn neutral_score(&self) -> i64 {
        self.config.neutral_score
    }
}

/// Classify a 200 response body.
fn classify_envelope(body: &str, delay: Duration) -> AttemptOutcome {
    let envelope: GenerateResponse = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) => {
            return AttemptOutcome::Retry {
                failure: JudgeFailure::Envelope(e.to_string()),
                delay,
                reinforce: None,
            };
        }
    };

    if let Some(error) = envelope.error {
        return AttemptOutcome::Retry {
            failure: JudgeFailure::Api(error.message),
            delay,
            reinforce: None,
        };
    }

    if let Some(usage) = &envelope.usage_metadata {
        debug!(
            prompt_tokens = usage.prompt_token_count,
            output_tokens = usage.candidates_token_count,
            "Judge usage"
        );
    }

    let candidate = envelope.candidates.into_iter().next();
    let reason = FinishReason::parse(
        candidate
            .as_ref()
            .and_then(|c| c.finish_reason.as_deref()),
    );
    let text: String = candidate
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    match reason {
        FinishReason::Safety => AttemptOutcome::Retry {
            failure: JudgeFailure::SafetyFiltered,
            delay,
            reinforce: Some(Reinforcement::Format),
        },
        FinishReason::MaxTokens if text.trim().is_empty() => {
            AttemptOutcome::Synthesize(JudgeFailure::Truncated)
        }
        FinishReason::MaxTokens => {
            debug!(chars = text.chars().count(), "Judge output truncated, using partial text");
            AttemptOutcome::Done(text)
        }
        FinishReason::Stop | FinishReason::Other(_) => {
            if let FinishReason::Other(r) = &reason {
                debug!(finish_reason = %r, "Unrecognized finish reason");
            }
            if looks_structured(&text) {
                AttemptOutcome::Done(text)
            } else {
                AttemptOutcome::Retry {
                    failure: JudgeFailure::Unstructured { text },
                    delay,
                    reinforce: Some(Reinforcement::StrictFormat),
                }
            }
        }
    }
}

fn looks_structured(text: &str) -> bool {
    !text.trim().is_empty() && (text.contains('{') || text.contains('['))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Highest participant index named in `prompt`, or [`DEFAULT_PARTICIPANTS`].
pub fn infer_participant_count(prompt: &str) -> usize {
    PARTICIPANT_MENTION
        .captures_iter(prompt)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .filter(|&n| (1..=MAX_PARTICIPANTS).contains(&n))
        .max()
        .unwrap_or(DEFAULT_PARTICIPANTS)
}

/// Default judgment for `prompt`: one neutral entry per inferred participant.
pub fn default_judgment_map(prompt: &str, neutral_score: i64) -> Map<String, Value> {
    let style = LabelStyle::detect(prompt);
    let (score_key, rationale_key, rationale) = match style {
        LabelStyle::English => (
            "score",
            "rationale",
            format!("Evaluation could not be completed; neutral score {neutral_score} assigned"),
        ),
        LabelStyle::Chinese => (
            "评分",
            "理由",
            format!("评测未能完成，使用中性评分 {neutral_score}"),
        ),
    };

    (1..=infer_participant_count(prompt))
        .map(|i| {
            let mut entry = Map::new();
            entry.insert(score_key.to_string(), json!(neutral_score));
            entry.insert(rationale_key.to_string(), json!(rationale));
            (style.label(i), Value::Object(entry))
        })
        .collect()
}

/// Serialized default judgment for `prompt`.
pub fn synthesize_default_judgment(prompt: &str, neutral_score: i64) -> String {
    Value::Object(default_judgment_map(prompt, neutral_score)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_count_uses_highest_index() {
        assert_eq!(infer_participant_count("模型1 ... 模型2 ... 模型3"), 3);
        assert_eq!(infer_participant_count("compare model1 and model_4"), 4);
        assert_eq!(infer_participant_count("no labels here"), DEFAULT_PARTICIPANTS);
        assert_eq!(infer_participant_count("model 100000"), DEFAULT_PARTICIPANTS);
    }

    #[test]
    fn synthesized_judgment_matches_prompt_vocabulary() {
        let map = default_judgment_map("请评价 模型1 模型2 模型3", 3);
        assert_eq!(map.len(), 3);
        assert_eq!(map["模型3"]["评分"], 3);

        let map = default_judgment_map("score model1 and model2", 2);
        assert_eq!(map.len(), 2);
        assert_eq!(map["model1"]["score"], 2);
        assert!(
            map["model2"]["rationale"]
                .as_str()
                .unwrap()
                .contains("could not be completed")
        );
    }

    #[test]
    fn synthesized_text_is_json() {
        let text = synthesize_default_judgment("model1 model2", 3);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn envelope_classification() {
        let delay = Duration::ZERO;
        let ok = r#"{"candidates":[{"finishReason":"STOP","content":{"parts":[{"text":"{\"model1\":{}}"}]}}]}"#;
        assert!(matches!(classify_envelope(ok, delay), AttemptOutcome::Done(t) if t == r#"{"model1":{}}"#));

        let safety = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        assert!(matches!(
            classify_envelope(safety, delay),
            AttemptOutcome::Retry { failure: JudgeFailure::SafetyFiltered, reinforce: Some(Reinforcement::Format), .. }
        ));

        let partial = r#"{"candidates":[{"finishReason":"MAX_TOKENS","content":{"parts":[{"text":"{\"model1\": {\"score\": 4"}]}}]}"#;
        assert!(matches!(classify_envelope(partial, delay), AttemptOutcome::Done(t) if t.starts_with("{\"model1\"")));

        let truncated = r#"{"candidates":[{"finishReason":"MAX_TOKENS","content":{"parts":[]}}]}"#;
        assert!(matches!(
            classify_envelope(truncated, delay),
            AttemptOutcome::Synthesize(JudgeFailure::Truncated)
        ));

        let prose = r#"{"candidates":[{"content":{"parts":[{"text":"All fine."}]}}]}"#;
        assert!(matches!(
            classify_envelope(prose, delay),
            AttemptOutcome::Retry { failure: JudgeFailure::Unstructured { text }, .. } if text == "All fine."
        ));

        let error = r#"{"error":{"message":"quota"}}"#;
        assert!(matches!(
            classify_envelope(error, delay),
            AttemptOutcome::Retry { failure: JudgeFailure::Api(m), .. } if m == "quota"
        ));
    }

    #[test]
    fn reinforcement_is_appended_once() {
        let mut state = RetryState::default();
        let mut prompt = "judge this".to_string();
        state.reinforce(&mut prompt, Reinforcement::StrictFormat);
        state.reinforce(&mut prompt, Reinforcement::StrictFormat);
        assert_eq!(prompt.matches("IMPORTANT").count(), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = JudgeConfig {
            retry_base_delay_ms: 100,
            ..JudgeConfig::default()
        };
        let client = ReliableJudgeClient::new(
            ModelDescriptor::judge("j", "http://localhost:1/{model}", "j", "K"),
            Arc::new(crate::client::StaticCredentials::new()),
            config,
        )
        .unwrap();
        assert_eq!(client.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(400));
    }
}
