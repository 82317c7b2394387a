//! Evaluator: judge each item's dispatched answers.
//!
//! Epistemic foundation:
//! - K_i: Participant `i` in the prompt is the `i`-th model in selection order
//! - K_i: Judge calls in flight are bounded by a semaphore
//! - B_i: The judge returns a usable mapping (might not → default judgment)

use crate::client::{JudgeBackend, default_judgment_map, synthesize_default_judgment};
use crate::models::{
    DispatchResult, EvalItem, EvaluationMode, EvaluationRow, JudgmentRecord, MISSING_ANSWER,
    ModelVerdict, ProgressObserver,
};
use crate::parse::{SalvageStage, salvage};
use crate::prompts::{Participant, PromptBuilder};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Status text shown while answers are judged.
pub const EVALUATING_STATUS: &str = "Evaluating answers";
/// Item category used when an item has none.
pub const UNCLASSIFIED: &str = "Unclassified";

/// Salvaged judge output for one prompt.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    pub record: JudgmentRecord,
    /// Raw judge text
    pub raw: String,
    /// Synthesized rather than produced by the judge
    pub fallback: bool,
    /// Salvage found nothing, so a default judgment was substituted
    pub unparsed: bool,
}

/// Judges dispatched answers with bounded concurrency.
pub struct Evaluator {
    judge: Arc<dyn JudgeBackend>,
    prompts: PromptBuilder,
    semaphore: Semaphore,
    concurrency: usize,
}

impl Evaluator {
    /// Create a new evaluator.
    pub fn new(judge: Arc<dyn JudgeBackend>, prompts: PromptBuilder, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            judge,
            prompts,
            semaphore: Semaphore::new(concurrency),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Judge one prompt and salvage its mapping.
    pub async fn judge_prompt(&self, prompt: &str) -> JudgeVerdict {
        let raw = match self.semaphore.acquire().await {
            Ok(_permit) => self.judge.judge(prompt).await,
            Err(_) => {
                warn!("Judge semaphore closed, synthesizing default judgment");
                synthesize_default_judgment(prompt, self.judge.neutral_score())
            }
        };

        let outcome = salvage(&raw);
        let synthesized = raw == synthesize_default_judgment(prompt, self.judge.neutral_score());

        if outcome.stage == SalvageStage::Failed {
            debug!(chars = raw.chars().count(), "Judge output unsalvageable, using default judgment");
            let fallback = default_judgment_map(prompt, self.judge.neutral_score());
            return JudgeVerdict {
                record: JudgmentRecord::from_map(&fallback),
                raw,
                fallback: true,
                unparsed: true,
            };
        }

        JudgeVerdict {
            record: JudgmentRecord::from_map(&outcome.value),
            raw,
            fallback: synthesized,
            unparsed: false,
        }
    }

    /// Judge item `index` (0-based) against the answers in `dispatched`.
    pub async fn evaluate_item(
        &self,
        index: usize,
        item: &EvalItem,
        mode: EvaluationMode,
        dispatched: &DispatchResult,
    ) -> EvaluationRow {
        let kind = item
            .kind
            .clone()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| UNCLASSIFIED.to_string());
        let reference = match mode {
            EvaluationMode::Objective => item.reference.clone(),
            EvaluationMode::Subjective => None,
        };

        let models = dispatched.models();
        if models.is_empty() {
            debug!(index = index + 1, "No answers to judge, skipping judge call");
            return EvaluationRow {
                index: index + 1,
                kind,
                query: item.query.clone(),
                reference,
                verdicts: Vec::new(),
                judgment: JudgmentRecord::new(),
                fallback: false,
                unparsed: false,
                judged_at: Utc::now(),
            };
        }

        let answers: Vec<&str> = models
            .iter()
            .map(|m| dispatched.answer(m, index).unwrap_or(MISSING_ANSWER))
            .collect();
        let participants: Vec<Participant<'_>> = models
            .iter()
            .zip(&answers)
            .map(|(&model, &answer)| Participant { model, answer })
            .collect();

        let prompt = self.prompts.build(mode, item, &participants);
        let verdict = self.judge_prompt(&prompt).await;

        let verdicts = participants
            .iter()
            .enumerate()
            .map(|(i, p)| ModelVerdict::new(p.model, p.answer, verdict.record.participant(i + 1)))
            .collect();

        EvaluationRow {
            index: index + 1,
            kind,
            query: item.query.clone(),
            reference,
            verdicts,
            judgment: verdict.record,
            fallback: verdict.fallback,
            unparsed: verdict.unparsed,
            judged_at: Utc::now(),
        }
    }

    /// Judge every item. Rows come back in item order.
    pub async fn evaluate(
        &self,
        items: &[EvalItem],
        mode: EvaluationMode,
        dispatched: &DispatchResult,
        observer: &dyn ProgressObserver,
    ) -> Vec<EvaluationRow> {
        observer.set_total(items.len());
        observer.set_status(EVALUATING_STATUS);

        let work = items.iter().enumerate().map(|(i, item)| async move {
            let row = self.evaluate_item(i, item, mode, dispatched).await;
            observer.increment();
            row
        });
        join_all(work).await
    }
}
