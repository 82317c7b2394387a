//! Judgment records produced from judge output.
//!
//! K_i: Participants are labelled in selection order ("model1", "model2", ...).
//! B_i: The judge uses the labels and field names it was asked for (might not).
//! I^R: The scoring scale belongs to the prompt, so scores stay opaque here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PARTICIPANT_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:model|模型)\s*[_-]?\s*(\d+)\s*$").expect("valid regex")
});

/// Field names accepted for each judgment attribute.
const SCORE_KEYS: &[&str] = &["score", "评分", "rating"];
const RATIONALE_KEYS: &[&str] = &["rationale", "理由", "reason", "reasoning"];
const ACCURACY_KEYS: &[&str] = &["accuracy", "准确性", "accuracy_tag"];

/// Vocabulary used for participant labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelStyle {
    /// `model1`, `model2`, ...
    #[default]
    English,
    /// `模型1`, `模型2`, ...
    Chinese,
}

impl LabelStyle {
    /// Label for the 1-based participant index.
    pub fn label(self, index: usize) -> String {
        match self {
            LabelStyle::English => format!("model{index}"),
            LabelStyle::Chinese => format!("模型{index}"),
        }
    }

    /// Style used by a prompt: Chinese if it mentions `模型`, English otherwise.
    pub fn detect(prompt: &str) -> Self {
        if prompt.contains("模型") {
            LabelStyle::Chinese
        } else {
            LabelStyle::English
        }
    }
}

/// Parse the 1-based participant index out of a label such as `model2` or `模型 2`.
pub fn participant_index(label: &str) -> Option<usize> {
    PARTICIPANT_LABEL
        .captures(label)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Opaque score: numeric or textual, depending on the rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Number(serde_json::Number),
    Text(String),
}

impl Score {
    /// Numeric view of the score, parsing textual scores such as `"4"`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Score::Number(n) => n.as_f64(),
            Score::Text(s) => s.trim().parse().ok(),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => Score::Number(n.clone()),
            Value::String(s) => Score::Text(s.trim().to_string()),
            Value::Null => Score::Text(String::new()),
            other => Score::Text(other.to_string()),
        }
    }
}

impl From<i64> for Score {
    fn from(value: i64) -> Self {
        Score::Number(value.into())
    }
}

impl std::fmt::Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Score::Number(n) => write!(f, "{n}"),
            Score::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Verdict for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub score: Score,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<String>,
}

impl Judgment {
    /// Lenient conversion from a salvaged JSON object.
    ///
    /// Returns `None` for non-objects or objects with none of the known fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let score = lookup(obj, SCORE_KEYS);
        let rationale = lookup(obj, RATIONALE_KEYS);
        let accuracy = lookup(obj, ACCURACY_KEYS);

        if score.is_none() && rationale.is_none() && accuracy.is_none() {
            return None;
        }

        Some(Self {
            score: score.map(Score::from_value).unwrap_or(Score::Text(String::new())),
            rationale: rationale.map(text_of).unwrap_or_default(),
            accuracy: accuracy.map(text_of).filter(|s| !s.is_empty()),
        })
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Participant label → judgment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JudgmentRecord {
    entries: BTreeMap<String, Judgment>,
}

impl JudgmentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from a salvaged mapping, dropping entries that are not judgments.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .filter_map(|(label, value)| Some((label.clone(), Judgment::from_value(value)?)))
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, label: impl Into<String>, judgment: Judgment) {
        self.entries.insert(label.into(), judgment);
    }

    pub fn get(&self, label: &str) -> Option<&Judgment> {
        self.entries.get(label)
    }

    /// Judgment for the 1-based participant index, whatever label vocabulary was used.
    pub fn participant(&self, index: usize) -> Option<&Judgment> {
        self.entries
            .iter()
            .find(|(label, _)| participant_index(label) == Some(index))
            .map(|(_, judgment)| judgment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Judgment)> {
        self.entries.iter()
    }
}
