//! Model descriptors: how to reach one backend.
//!
//! K_i: A descriptor is immutable once the catalog is built.
//! I^R: Extra descriptors can be supplied through `[[models]]` in the config file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder substituted with the query text in request templates.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Placeholder substituted with the upstream model id in endpoint URLs.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// `event:`/`data:` stream with `{content}` payloads under the `message` event.
    EventStream,
    /// `event:`/`data:` stream with `{choices:[{delta:{content}}]}` payloads
    /// under `APPEND`, terminated by `FINISH`.
    DeltaStream,
    /// Non-streaming generate-content REST API used by the judge.
    JudgeRest,
}

impl ProtocolFamily {
    /// Whether this family serves fan-out answers (as opposed to judging).
    pub fn is_fan_out(self) -> bool {
        !matches!(self, Self::JudgeRest)
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFamily::EventStream => write!(f, "event-stream"),
            ProtocolFamily::DeltaStream => write!(f, "delta-stream"),
            ProtocolFamily::JudgeRest => write!(f, "judge-rest"),
        }
    }
}

/// One `{key, value}` slot of an instruction request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSlot {
    pub key: String,
    pub value: String,
}

impl ParameterSlot {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Slot value with the query substituted when this is the prompt slot.
    pub fn render(&self, query: &str) -> String {
        if self.value == PROMPT_PLACEHOLDER {
            query.to_string()
        } else {
            self.value.clone()
        }
    }
}

/// Shape of the request body sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestTemplate {
    /// `{model, features: {web_search}, query, chat_id}`
    ChatStream {
        #[serde(default)]
        web_search: bool,
    },
    /// `{key, parameters: [{key, value}], model, stream}`
    Instruction {
        key: String,
        #[serde(default = "default_stream")]
        stream: bool,
        parameters: Vec<ParameterSlot>,
    },
}

fn default_stream() -> bool {
    true
}

impl RequestTemplate {
    /// Template used when a descriptor does not name one. The judge family
    /// builds its own body and has none.
    pub fn default_for(family: ProtocolFamily) -> Option<Self> {
        match family {
            ProtocolFamily::EventStream => Some(Self::ChatStream { web_search: false }),
            ProtocolFamily::DeltaStream => Some(Self::common_writing()),
            ProtocolFamily::JudgeRest => None,
        }
    }

    /// The writing-assistant instruction template.
    pub fn common_writing() -> Self {
        Self::Instruction {
            key: "common_writing".to_string(),
            stream: true,
            parameters: vec![
                ParameterSlot::new("user_instruction", PROMPT_PLACEHOLDER),
                ParameterSlot::new("uploaded_rel", ""),
                ParameterSlot::new("with_search", "false"),
                ParameterSlot::new("files", "[]"),
            ],
        }
    }
}

/// Description of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Catalog name (unique)
    pub name: String,

    /// Wire protocol
    pub family: ProtocolFamily,

    /// Endpoint URL, may contain `{model}`
    pub endpoint: String,

    /// Upstream model identifier (defaults to `name`)
    #[serde(default)]
    pub model_id: Option<String>,

    /// Name of the secret holding the credential
    pub credential_key: String,

    /// Static headers; values may contain `${ENV_VAR}`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request body template (defaults per family)
    #[serde(default)]
    pub template: Option<RequestTemplate>,
}

impl ModelDescriptor {
    /// Chat-stream backend speaking the `message` event grammar.
    pub fn event_stream(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        credential_key: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "text/event-stream".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            name: name.into(),
            family: ProtocolFamily::EventStream,
            endpoint: endpoint.into(),
            model_id: None,
            credential_key: credential_key.into(),
            headers,
            template: Some(RequestTemplate::ChatStream { web_search: false }),
        }
    }

    /// Instruction-completion backend speaking the `APPEND`/`FINISH` grammar.
    pub fn delta_stream(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
        credential_key: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-App-Id".to_string(), "2".to_string());
        Self {
            name: name.into(),
            family: ProtocolFamily::DeltaStream,
            endpoint: endpoint.into(),
            model_id: Some(model_id.into()),
            credential_key: credential_key.into(),
            headers,
            template: Some(RequestTemplate::common_writing()),
        }
    }

    /// Judge backend.
    pub fn judge(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: impl Into<String>,
        credential_key: impl Into<String>,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            name: name.into(),
            family: ProtocolFamily::JudgeRest,
            endpoint: endpoint.into(),
            model_id: Some(model_id.into()),
            credential_key: credential_key.into(),
            headers,
            template: None,
        }
    }

    /// Upstream model identifier.
    pub fn upstream_model(&self) -> &str {
        self.model_id.as_deref().unwrap_or(&self.name)
    }

    /// Endpoint with `{model}` substituted.
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .replace(MODEL_PLACEHOLDER, self.upstream_model())
    }

    /// Host part of the endpoint, used to key per-host connection caps.
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.endpoint_url())
            .ok()
            .and_then(|url| {
                url.host_str()
                    .map(|h| format!("{h}:{}", url.port_or_known_default().unwrap_or(0)))
            })
            .unwrap_or_else(|| self.endpoint.clone())
    }

    /// Request template, falling back to the family default.
    pub fn request_template(&self) -> Option<RequestTemplate> {
        self.template
            .clone()
            .or_else(|| RequestTemplate::default_for(self.family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_substitutes_model() {
        let d = ModelDescriptor::judge(
            "judge",
            "https://example.test/v1beta/models/{model}:generateContent",
            "gemini-pro",
            "GOOGLE_API_KEY",
        );
        assert_eq!(
            d.endpoint_url(),
            "https://example.test/v1beta/models/gemini-pro:generateContent"
        );
        assert_eq!(d.host(), "example.test:443");
        assert!(d.request_template().is_none());
    }

    #[test]
    fn prompt_slot_is_substituted() {
        let slot = ParameterSlot::new("user_instruction", PROMPT_PLACEHOLDER);
        assert_eq!(slot.render("hello"), "hello");
        let fixed = ParameterSlot::new("with_search", "false");
        assert_eq!(fixed.render("hello"), "false");
    }

    #[test]
    fn template_parses_from_toml() {
        let d: ModelDescriptor = toml::from_str(
            r#"
name = "writer"
family = "delta_stream"
endpoint = "https://copilot.example/api/instruction/completion"
model_id = "W-1"
credential_key = "WRITER_COOKIE"

[template]
kind = "instruction"
key = "common_writing"
parameters = [
    { key = "user_instruction", value = "{prompt}" },
    { key = "files", value = "[]" },
]
"#,
        )
        .unwrap();
        assert_eq!(d.family, ProtocolFamily::DeltaStream);
        assert_eq!(d.upstream_model(), "W-1");
        match d.request_template() {
            Some(RequestTemplate::Instruction {
                key,
                stream,
                parameters,
            }) => {
                assert_eq!(key, "common_writing");
                assert!(stream);
                assert_eq!(parameters.len(), 2);
            }
            other => panic!("unexpected template {other:?}"),
        }
    }

    #[test]
    fn missing_template_defaults_by_family() {
        let d: ModelDescriptor = toml::from_str(
            r#"
name = "chat"
family = "event_stream"
endpoint = "https://chat.example/stream"
credential_key = "CHAT_KEY"
"#,
        )
        .unwrap();
        assert_eq!(d.upstream_model(), "chat");
        assert_eq!(
            d.request_template(),
            Some(RequestTemplate::ChatStream { web_search: false })
        );
    }
}
