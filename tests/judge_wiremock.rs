use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use evalmux::client::{JudgeBackend, ReliableJudgeClient, StaticCredentials};
use evalmux::models::{JudgeConfig, ModelDescriptor};
use serde_json::{Value, json};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const JUDGE_PATH: &str = "/v1beta/models/gemini-test:generateContent";
const PROMPT: &str = "请评价 模型1、模型2 和 模型3 的回答";

fn reply(text: &str, finish_reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "candidates": [{
            "finishReason": finish_reason,
            "content": { "parts": [{ "text": text }] }
        }],
        "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5 }
    }))
}

/// Responds with each template in turn, repeating the last one.
struct SequenceResponder {
    responses: Vec<ResponseTemplate>,
    calls: AtomicUsize,
}

impl SequenceResponder {
    fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let last = self.responses.len() - 1;
        self.responses[n.min(last)].clone()
    }
}

fn judge(server: &MockServer, max_attempts: u32) -> ReliableJudgeClient {
    judge_with(server, max_attempts, StaticCredentials::new().with("JUDGE_KEY", "secret"))
}

fn judge_with(
    server: &MockServer,
    max_attempts: u32,
    credentials: StaticCredentials,
) -> ReliableJudgeClient {
    let descriptor = ModelDescriptor::judge(
        "gemini-test",
        format!("{}/v1beta/models/{{model}}:generateContent", server.uri()),
        "gemini-test",
        "JUDGE_KEY",
    );
    let config = JudgeConfig {
        model: "gemini-test".to_string(),
        max_attempts,
        retry_base_delay_ms: 1,
        retry_delay_ms: 1,
        timeout_secs: 5,
        ..JudgeConfig::default()
    };
    ReliableJudgeClient::new(descriptor, Arc::new(credentials), config).unwrap()
}

fn parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn structured_reply_is_returned_with_api_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .and(header("x-goog-api-key", "secret"))
        .respond_with(reply(r#"{"模型1":{"评分":5}}"#, "STOP"))
        .expect(1)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge(PROMPT).await;
    assert_eq!(text, r#"{"模型1":{"评分":5}}"#);
}

#[tokio::test]
async fn generation_settings_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(reply("{}", "STOP"))
        .mount(&server)
        .await;

    judge(&server, 1).judge(PROMPT).await;

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["contents"][0]["parts"][0]["text"], PROMPT);
    assert_eq!(body["generationConfig"]["topK"], 1);
    assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
}

#[tokio::test]
async fn single_attempt_failure_synthesizes_one_entry_per_participant() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let text = judge(&server, 1).judge(PROMPT).await;
    let value = parse(&text);
    let map = value.as_object().unwrap();
    assert_eq!(map.len(), 3);
    for label in ["模型1", "模型2", "模型3"] {
        assert_eq!(map[label]["评分"], 3);
    }
}

#[tokio::test]
async fn server_errors_use_every_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("compare model1 and model2").await;
    let value = parse(&text);
    assert_eq!(value["model1"]["score"], 3);
    assert_eq!(value["model2"]["score"], 3);
}

#[tokio::test]
async fn rate_limit_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(SequenceResponder::new(vec![
            ResponseTemplate::new(429),
            reply(r#"{"model1":{"score":4}}"#, "STOP"),
        ]))
        .expect(2)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("model1").await;
    assert_eq!(parse(&text)["model1"]["score"], 4);
}

#[tokio::test]
async fn safety_block_reinforces_prompt_before_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(SequenceResponder::new(vec![
            reply("", "SAFETY"),
            reply(r#"{"model1":{"score":2}}"#, "STOP"),
        ]))
        .expect(2)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("model1").await;
    assert_eq!(parse(&text)["model1"]["score"], 2);

    let requests = server.received_requests().await.unwrap();
    let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let first = first["contents"][0]["parts"][0]["text"].as_str().unwrap();
    let second = second["contents"][0]["parts"][0]["text"].as_str().unwrap();
    assert_eq!(first, "model1");
    assert!(second.starts_with("model1"));
    assert!(second.len() > first.len());
}

#[tokio::test]
async fn persistent_safety_block_reports_filter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(reply("", "SAFETY"))
        .expect(2)
        .mount(&server)
        .await;

    let text = judge(&server, 2).judge("model1").await;
    assert_eq!(text, "Judge response blocked by safety filter");
}

#[tokio::test]
async fn truncated_reply_returns_partial_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(reply(r#"{"model1":{"score":5,"rationale":"goo"#, "MAX_TOKENS"))
        .expect(1)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("model1").await;
    assert_eq!(text, r#"{"model1":{"score":5,"rationale":"goo"#);
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid argument"))
        .expect(1)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("model1 model2").await;
    assert_eq!(parse(&text).as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn prose_reply_is_retried_until_structured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(SequenceResponder::new(vec![
            reply("Both answers are fine.", "STOP"),
            reply(r#"{"model1":{"score":3}}"#, "STOP"),
        ]))
        .expect(2)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("model1").await;
    assert_eq!(parse(&text)["model1"]["score"], 3);
}

#[tokio::test]
async fn missing_credential_synthesizes_without_calling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(reply("{}", "STOP"))
        .expect(0)
        .mount(&server)
        .await;

    let client = judge_with(&server, 3, StaticCredentials::new());
    let text = client.judge(PROMPT).await;
    assert_eq!(parse(&text).as_object().unwrap().len(), 3);
    assert_eq!(client.neutral_score(), 3);
}

#[tokio::test]
async fn last_prose_reply_is_returned_unchanged() {
    let server = MockServer::start().await;
    let prose = "Model 1 is better; I give it 4 and model 2 gets 2.";
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(reply(prose, "STOP"))
        .expect(1)
        .mount(&server)
        .await;

    let text = judge(&server, 1).judge("compare model1 and model2").await;
    assert_eq!(text, prose);
}

#[tokio::test]
async fn empty_reply_on_last_attempt_synthesizes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(reply("  ", "STOP"))
        .expect(2)
        .mount(&server)
        .await;

    let text = judge(&server, 2).judge("compare model1 and model2").await;
    assert_eq!(parse(&text)["model2"]["score"], 3);
}

#[tokio::test]
async fn rate_limit_exhaustion_synthesizes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge(PROMPT).await;
    let value = parse(&text);
    assert_eq!(value.as_object().unwrap().len(), 3);
    assert_eq!(value["模型1"]["评分"], 3);
}

#[tokio::test]
async fn error_envelope_exhaustion_synthesizes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(JUDGE_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "error": { "message": "quota exceeded" } })),
        )
        .expect(3)
        .mount(&server)
        .await;

    let text = judge(&server, 3).judge("compare model1 and model2").await;
    let value = parse(&text);
    assert_eq!(value.as_object().unwrap().len(), 2);
    assert_eq!(value["model1"]["score"], 3);
    assert!(
        value["model1"]["rationale"]
            .as_str()
            .unwrap()
            .contains("could not be completed")
    );
}
