//! Salvage a judgment mapping out of free-form judge text.
//!
//! Epistemic foundation:
//! - K_i: The wanted payload is a JSON object keyed by participant label
//! - B_i: The judge wraps it in fences, prose or truncation (often does)
//! - I^B: Which defect occurred is unknowable → try ordered strategies
//!
//! Never fails: total failure is an empty mapping.

use crate::parse::Repair;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value, json};
use std::sync::LazyLock;
use tracing::{debug, trace};

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)```").expect("valid regex"));
static ANY_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)```").expect("valid regex"));
static OPEN_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*)$").expect("valid regex"));
static LABELLED_SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)"?((?:model|模型)\s*[_-]?\s*\d+)"?\s*[:：]\s*\{[^{}]*?"?(?:score|评分|rating)"?\s*[:：]\s*"?(-?\d+(?:\.\d+)?)"#,
    )
    .expect("valid regex")
});

/// Rationale recorded for entries recovered by the pattern fallback.
pub const AUTO_EXTRACTED: &str = "auto-extracted";

/// Lead-in phrases judges put before the payload.
const PREAMBLES: &[&str] = &[
    "here is the json response:",
    "here is the json:",
    "here's the json:",
    "here is the evaluation:",
    "here is my evaluation:",
    "here is the result:",
    "sure, here is the json:",
    "sure!",
    "sure,",
    "json:",
    "json",
    "以下是评测结果：",
    "以下是评分结果：",
    "以下是评分：",
    "评分结果：",
    "评测结果：",
];

/// How a mapping was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", content = "repairs", rename_all = "snake_case")]
pub enum SalvageStage {
    /// Decoded as-is after fence and preamble stripping
    Direct,
    /// Decoded after the listed repairs
    Repaired(Vec<Repair>),
    /// Recovered label/score pairs from raw text
    PatternFallback,
    /// Nothing recovered
    Failed,
}

/// Result of a salvage attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SalvageOutcome {
    pub value: Map<String, Value>,
    pub stage: SalvageStage,
}

impl SalvageOutcome {
    fn failed() -> Self {
        Self {
            value: Map::new(),
            stage: SalvageStage::Failed,
        }
    }

    /// Number of repairs applied before decoding succeeded.
    pub fn repairs_applied(&self) -> usize {
        match &self.stage {
            SalvageStage::Repaired(repairs) => repairs.len(),
            _ => 0,
        }
    }
}

/// Recover a mapping from `raw`; empty on total failure.
pub fn parse(raw: &str) -> Map<String, Value> {
    salvage(raw).value
}

/// Recover a mapping from `raw`, reporting which stage succeeded.
pub fn salvage(raw: &str) -> SalvageOutcome {
    let unfenced = unfence(raw);
    let text = strip_preamble(unfenced);

    let outcome = match text.find(['{', '[']) {
        Some(start) => decode_with_repairs(&text[start..]),
        None => None,
    };

    let outcome = outcome
        .or_else(|| pattern_fallback(raw))
        .unwrap_or_else(SalvageOutcome::failed);

    debug!(stage = ?outcome.stage, entries = outcome.value.len(), "Salvaged judge output");
    outcome
}

/// Interior of a ```json fence, else of the first generic fence, else `raw`.
fn unfence(raw: &str) -> &str {
    let captured = JSON_FENCE
        .captures(raw)
        .or_else(|| ANY_FENCE.captures(raw))
        .or_else(|| OPEN_FENCE.captures(raw));
    captured
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim()
}

fn strip_preamble(text: &str) -> &str {
    let mut text = text.trim_start();
    'outer: loop {
        for preamble in PREAMBLES {
            let matched = text
                .get(..preamble.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(preamble));
            if matched {
                text = text[preamble.len()..].trim_start();
                continue 'outer;
            }
        }
        return text;
    }
}

fn decode_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => None,
        Err(e) => {
            trace!(error = %e, "Decode failed");
            None
        }
    }
}

fn decode_with_repairs(text: &str) -> Option<SalvageOutcome> {
    if let Some(value) = decode_object(text) {
        return Some(SalvageOutcome {
            value,
            stage: SalvageStage::Direct,
        });
    }

    let mut current = text.to_string();
    let mut applied = Vec::new();
    for repair in Repair::ORDER {
        let Some(next) = repair.apply(&current) else {
            continue;
        };
        current = next;
        applied.push(repair);
        if let Some(value) = decode_object(&current) {
            return Some(SalvageOutcome {
                value,
                stage: SalvageStage::Repaired(applied),
            });
        }
    }
    None
}

fn pattern_fallback(raw: &str) -> Option<SalvageOutcome> {
    let mut value = Map::new();
    for caps in LABELLED_SCORE.captures_iter(raw) {
        let (Some(label), Some(score)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let Some(score) = parse_number(score.as_str()) else {
            continue;
        };
        value
            .entry(label.as_str().trim().to_string())
            .or_insert_with(|| json!({ "score": score, "rationale": AUTO_EXTRACTED }));
    }

    (!value.is_empty()).then_some(SalvageOutcome {
        value,
        stage: SalvageStage::PatternFallback,
    })
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(n) = s.parse::<i64>() {
        return Some(n.into());
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}
