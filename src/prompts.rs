//! Evaluation prompts for the judge.
//!
//! Participants are labelled in selection order, so the judge's keys can be
//! mapped back to model names without exposing which label is which model.

use crate::models::{EvalItem, EvaluationMode, LabelStyle};
use std::fmt::Write;

/// One answer shown to the judge.
#[derive(Debug, Clone, Copy)]
pub struct Participant<'a> {
    pub model: &'a str,
    pub answer: &'a str,
}

/// Builds subjective and objective evaluation prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder {
    style: LabelStyle,
}

impl PromptBuilder {
    pub fn new(style: LabelStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> LabelStyle {
        self.style
    }

    /// Prompt for `item` in `mode`.
    pub fn build(&self, mode: EvaluationMode, item: &EvalItem, participants: &[Participant<'_>]) -> String {
        let kind = item.kind.as_deref().filter(|k| !k.trim().is_empty());
        match (mode, item.reference.as_deref()) {
            (EvaluationMode::Objective, Some(reference)) => {
                self.objective(&item.query, reference, kind, participants)
            }
            _ => self.subjective(&item.query, kind, participants),
        }
    }

    /// Quality rubric without a reference answer.
    pub fn subjective(&self, query: &str, kind: Option<&str>, participants: &[Participant<'_>]) -> String {
        let answers = self.answers_block(participants);
        let format = self.response_format(participants.len(), false);
        match self.style {
            LabelStyle::English => format!(
                "Rate the quality of each AI model answer below on an integer scale of 0-5.\n\n\
                 {kind}Question: {query}\n\n\
                 {answers}\
                 Scoring rubric:\n\
                 - 5: excellent, clear reasoning and rich content\n\
                 - 4: good, meets the requirements\n\
                 - 3: average, of some value\n\
                 - 2: poor, of limited value\n\
                 - 1: very poor, almost no value\n\
                 - 0: no answer or entirely irrelevant\n\n\
                 Output JSON only, with no other text: {format}\n",
                kind = kind.map(|k| format!("Question type: {k}\n")).unwrap_or_default(),
            ),
            LabelStyle::Chinese => format!(
                "请对以下AI模型回答进行主观质量评分（0-5分，整数）。\n\n\
                 {kind}问题: {query}\n\n\
                 {answers}\
                 评分标准:\n\
                 - 5分: 回答优秀，逻辑清晰，内容丰富\n\
                 - 4分: 回答良好，基本符合要求\n\
                 - 3分: 回答一般，有一定价值\n\
                 - 2分: 回答较差，价值有限\n\
                 - 1分: 回答很差，几乎无价值\n\
                 - 0分: 无回答或完全无关\n\n\
                 只输出JSON格式，不要其他文字: {format}\n",
                kind = kind.map(|k| format!("问题类型: {k}\n")).unwrap_or_default(),
            ),
        }
    }

    /// Correctness rubric against `reference`, with an accuracy tag.
    pub fn objective(
        &self,
        query: &str,
        reference: &str,
        kind: Option<&str>,
        participants: &[Participant<'_>],
    ) -> String {
        let answers = self.answers_block(participants);
        let format = self.response_format(participants.len(), true);
        match self.style {
            LabelStyle::English => format!(
                "Grade each AI model answer below against the reference answer on an integer scale of 0-5.\n\n\
                 {kind}Question: {query}\n\
                 Reference answer: {reference}\n\n\
                 {answers}\
                 Scoring rubric:\n\
                 - 5: fully correct and clearly stated\n\
                 - 4: essentially correct with minor flaws\n\
                 - 3: partially correct\n\
                 - 2: mostly wrong with some correct elements\n\
                 - 1: wrong but related\n\
                 - 0: wrong or irrelevant\n\n\
                 Output JSON only: {format}\n",
                kind = kind.map(|k| format!("Question type: {k}\n")).unwrap_or_default(),
            ),
            LabelStyle::Chinese => format!(
                "请对照标准答案为AI模型回答评分（0-5分，整数）。\n\n\
                 {kind}问题: {query}\n\
                 标准答案: {reference}\n\n\
                 {answers}\
                 评分标准:\n\
                 - 5分: 完全正确，表述清晰\n\
                 - 4分: 基本正确，略有瑕疵\n\
                 - 3分: 部分正确\n\
                 - 2分: 大部分错误但有正确元素\n\
                 - 1分: 完全错误但相关\n\
                 - 0分: 完全错误或无关\n\n\
                 只输出JSON格式: {format}\n",
                kind = kind.map(|k| format!("问题类型: {k}\n")).unwrap_or_default(),
            ),
        }
    }

    fn answers_block(&self, participants: &[Participant<'_>]) -> String {
        let mut block = String::new();
        for (i, p) in participants.iter().enumerate() {
            let label = self.style.label(i + 1);
            // Writing to a String cannot fail.
            let _ = match self.style {
                LabelStyle::English => write!(block, "{label} ({}) answer: {}\n\n", p.model, p.answer),
                LabelStyle::Chinese => write!(block, "{label}({})回答: {}\n\n", p.model, p.answer),
            };
        }
        block
    }

    /// Example JSON shape, keys in participant order.
    fn response_format(&self, count: usize, with_accuracy: bool) -> String {
        let entry = match (self.style, with_accuracy) {
            (LabelStyle::English, false) => r#"{"score": "0-5", "rationale": "reason for the score"}"#,
            (LabelStyle::English, true) => {
                r#"{"score": "0-5", "accuracy": "correct/partially correct/incorrect", "rationale": "reason for the score"}"#
            }
            (LabelStyle::Chinese, false) => r#"{"评分": "0-5", "理由": "评分理由"}"#,
            (LabelStyle::Chinese, true) => {
                r#"{"评分": "0-5", "准确性": "正确/部分正确/错误", "理由": "评分理由"}"#
            }
        };
        let body = (1..=count)
            .map(|i| format!("\"{}\": {entry}", self.style.label(i)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{body}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::infer_participant_count;

    fn participants() -> Vec<Participant<'static>> {
        vec![
            Participant { model: "HKGAI-V1", answer: "first" },
            Participant { model: "HKGAI-V2", answer: "second" },
            Participant { model: "HKGAI-V1-PROD", answer: "third" },
        ]
    }

    #[test]
    fn subjective_prompt_labels_in_order() {
        let prompt = PromptBuilder::default().subjective("What is Rust?", Some("tech"), &participants());
        let first = prompt.find("model1 (HKGAI-V1) answer: first").unwrap();
        let third = prompt.find("model3 (HKGAI-V1-PROD) answer: third").unwrap();
        assert!(first < third);
        assert!(prompt.contains("Question type: tech"));
        assert!(prompt.contains(r#""model3": {"score": "0-5""#));
        assert_eq!(infer_participant_count(&prompt), 3);
    }

    #[test]
    fn objective_prompt_carries_reference_and_accuracy() {
        let item = EvalItem::new("2+2?").with_reference("4");
        let prompt = PromptBuilder::new(LabelStyle::Chinese).build(
            EvaluationMode::Objective,
            &item,
            &participants()[..2],
        );
        assert!(prompt.contains("标准答案: 4"));
        assert!(prompt.contains("模型2(HKGAI-V2)回答: second"));
        assert!(prompt.contains(r#""模型2": {"评分": "0-5", "准确性""#));
        assert!(!prompt.contains("问题类型"));
        assert_eq!(LabelStyle::detect(&prompt), LabelStyle::Chinese);
    }

    #[test]
    fn objective_mode_without_reference_falls_back() {
        let item = EvalItem::new("q");
        let prompt = PromptBuilder::default().build(EvaluationMode::Objective, &item, &participants());
        assert!(!prompt.contains("Reference answer"));
    }
}
