//! Query, dispatch and evaluation data types.
//!
//! K_i: These types represent the data flow from queries to judged rows.

use crate::models::{Judgment, JudgmentRecord, Score};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Answer recorded when a model produced nothing for an item.
pub const MISSING_ANSWER: &str = "Failed to fetch answer";

/// One evaluation item.
///
/// K_i: Every item has query text; the reference answer decides the mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalItem {
    /// The query sent to every selected model
    pub query: String,

    /// Question category, passed into the judge prompt
    #[serde(default, alias = "type")]
    pub kind: Option<String>,

    /// Reference answer for objective grading
    #[serde(default, alias = "answer")]
    pub reference: Option<String>,
}

impl EvalItem {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            kind: None,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// How answers are graded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    /// Graded against a reference answer, with an accuracy tag
    Objective,
    /// Graded on quality alone
    Subjective,
}

impl EvaluationMode {
    /// Objective when any item carries a reference answer.
    pub fn detect(items: &[EvalItem]) -> Self {
        if items
            .iter()
            .any(|i| i.reference.as_deref().is_some_and(|r| !r.trim().is_empty()))
        {
            EvaluationMode::Objective
        } else {
            EvaluationMode::Subjective
        }
    }
}

/// Ordered answers of one model, position `i` answering query `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAnswers {
    pub model: String,
    pub answers: Vec<String>,
}

/// Result of one dispatch call.
///
/// K_i: Contains exactly the resolvable models, in selection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchResult {
    entries: Vec<ModelAnswers>,
}

impl DispatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, model: impl Into<String>, answers: Vec<String>) {
        self.entries.push(ModelAnswers {
            model: model.into(),
            answers,
        });
    }

    /// Answers of one model.
    pub fn get(&self, model: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|e| e.model == model)
            .map(|e| e.answers.as_slice())
    }

    /// Answer of `model` to query `index`.
    pub fn answer(&self, model: &str, index: usize) -> Option<&str> {
        self.get(model)?.get(index).map(String::as_str)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.get(model).is_some()
    }

    /// Model names in selection order.
    pub fn models(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.model.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelAnswers> {
        self.entries.iter()
    }
}

/// Graded answer of one model for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub model: String,
    pub answer: String,
    /// `None` when the judge output had no entry for this model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<String>,
}

impl ModelVerdict {
    pub fn new(model: impl Into<String>, answer: impl Into<String>, judgment: Option<&Judgment>) -> Self {
        Self {
            model: model.into(),
            answer: answer.into(),
            score: judgment.map(|j| j.score.clone()),
            rationale: judgment.map(|j| j.rationale.clone()).unwrap_or_default(),
            accuracy: judgment.and_then(|j| j.accuracy.clone()),
        }
    }
}

/// One judged evaluation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    /// 1-based position of the item
    pub index: usize,
    pub kind: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub verdicts: Vec<ModelVerdict>,
    /// Salvaged judgment as returned by the judge
    pub judgment: JudgmentRecord,
    /// Whether the judgment is a synthesized fallback
    pub fallback: bool,
    /// Whether the judge text could not be salvaged at all
    #[serde(default)]
    pub unparsed: bool,
    pub judged_at: DateTime<Utc>,
}

/// Statistics for an evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Total items processed
    pub total_items: usize,

    /// Models that were dispatched
    pub total_models: usize,

    /// Answers collected (items × models)
    pub total_answers: usize,

    /// Items judged
    pub total_judged: usize,

    /// Items judged by a synthesized fallback
    pub total_fallback: usize,

    /// Items whose judgment could not be salvaged at all
    pub total_unparsed: usize,

    /// Total runtime in seconds
    pub runtime_secs: f64,

    /// Items per hour throughput
    pub throughput_per_hour: f64,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.total_judged as f64 / self.runtime_secs * 3600.0;
        }
    }
}
