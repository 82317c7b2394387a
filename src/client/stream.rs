//! Assembly of streamed backend output into plain answer text.
//!
//! Both grammars are line oriented: `event:<name>` sets the current event and
//! `data:<json>` carries a payload for it. Blank lines, unknown events and
//! undecodable payloads are skipped; a stream with nothing usable yields "".

use crate::models::ProtocolFamily;
use serde::Deserialize;
use tracing::trace;

const EVENT_PREFIX: &str = "event:";
const DATA_PREFIX: &str = "data:";

/// Event whose payloads carry content in grammar A.
pub const MESSAGE_EVENT: &str = "message";
/// Event whose payloads carry content in grammar B.
pub const APPEND_EVENT: &str = "APPEND";
/// Event that ends assembly in grammar B.
pub const FINISH_EVENT: &str = "FINISH";

/// Line grammar of a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamGrammar {
    /// `message` events with `{content}` payloads; ends with the stream.
    Message,
    /// `APPEND` events with `{choices:[{delta:{content}}]}` payloads; ends at `FINISH`.
    Delta,
}

impl StreamGrammar {
    /// Grammar spoken by a protocol family, `None` for non-streaming families.
    pub fn for_family(family: ProtocolFamily) -> Option<Self> {
        match family {
            ProtocolFamily::EventStream => Some(Self::Message),
            ProtocolFamily::DeltaStream => Some(Self::Delta),
            ProtocolFamily::JudgeRest => None,
        }
    }

    fn content_event(self) -> &'static str {
        match self {
            Self::Message => MESSAGE_EVENT,
            Self::Delta => APPEND_EVENT,
        }
    }

    fn finish_event(self) -> Option<&'static str> {
        match self {
            Self::Message => None,
            Self::Delta => Some(FINISH_EVENT),
        }
    }

    fn payload_content(self, json: &str) -> Option<String> {
        match self {
            Self::Message => serde_json::from_str::<MessagePayload>(json)
                .ok()?
                .content,
            Self::Delta => serde_json::from_str::<DeltaPayload>(json)
                .ok()?
                .choices?
                .into_iter()
                .next()?
                .delta?
                .content,
        }
    }
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    #[serde(default)]
    choices: Option<Vec<DeltaChoice>>,
}

#[derive(Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Assemble the answer text carried by `lines`.
pub fn extract_stream_content<I, S>(grammar: StreamGrammar, lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buffer = String::new();
    let mut current_event: Option<String> = None;

    for raw_line in lines {
        let line = raw_line.as_ref().trim();
        if line.is_empty() {
            continue;
        }

        if let Some(event) = line.strip_prefix(EVENT_PREFIX) {
            let event = event.trim();
            if grammar.finish_event() == Some(event) {
                break;
            }
            current_event = Some(event.to_string());
            continue;
        }

        let Some(json) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        if current_event.as_deref() != Some(grammar.content_event()) {
            continue;
        }

        match grammar.payload_content(json.trim()) {
            Some(content) if !content.is_empty() => buffer.push_str(&content),
            Some(_) => {}
            None => trace!(payload = %json, "Skipping undecodable stream payload"),
        }
    }

    buffer
}
