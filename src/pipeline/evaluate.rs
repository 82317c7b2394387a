//! Evaluation pipeline.
//!
//! Pipeline flow:
//! Items (JSONL) → Dispatcher → Answers → Evaluator → Judged rows → JSONL

use crate::client::{CredentialStore, ModelCatalog, ReliableJudgeClient};
use crate::models::{
    Config, EvalItem, EvaluationMode, EvaluationRow, EvalmuxError, LabelStyle, ProgressObserver,
    Result, RunStats,
};
use crate::pool::{Dispatcher, Evaluator};
use crate::prompts::PromptBuilder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// End-to-end evaluation: dispatch, judge, write.
pub struct EvaluationPipeline {
    dispatcher: Dispatcher,
    evaluator: Evaluator,
}

impl EvaluationPipeline {
    /// Create a pipeline from configuration.
    pub fn new(
        config: &Config,
        catalog: Arc<ModelCatalog>,
        credentials: Arc<dyn CredentialStore>,
        style: LabelStyle,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::with_provider(
            Arc::clone(&catalog),
            Arc::clone(&credentials),
            config.dispatch.clone(),
        )?;
        let judge = ReliableJudgeClient::from_catalog(&catalog, credentials, config.judge.clone())?;
        let evaluator = Evaluator::new(
            Arc::new(judge),
            PromptBuilder::new(style),
            config.judge.concurrency,
        );
        Ok(Self::from_parts(dispatcher, evaluator))
    }

    /// Assemble a pipeline from prepared components.
    pub fn from_parts(dispatcher: Dispatcher, evaluator: Evaluator) -> Self {
        Self {
            dispatcher,
            evaluator,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Load items from a JSONL file.
    pub fn load_items(path: &Path) -> Result<Vec<EvalItem>> {
        let file = File::open(path).map_err(|e| EvalmuxError::io("opening items file", e))?;
        let reader = BufReader::new(file);
        let mut items = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| EvalmuxError::io("reading items file", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: EvalItem = serde_json::from_str(&line).map_err(|e| {
                EvalmuxError::ParseError(format!("Line {}: {}", line_num + 1, e))
            })?;
            items.push(item);
        }

        info!(count = items.len(), "Loaded items");
        Ok(items)
    }

    /// Judge `items` answered by `models`, returning rows in item order.
    pub async fn evaluate(
        &self,
        items: &[EvalItem],
        models: &[String],
        observer: &dyn ProgressObserver,
    ) -> Vec<EvaluationRow> {
        let mode = EvaluationMode::detect(items);
        let queries: Vec<String> = items.iter().map(|i| i.query.clone()).collect();

        let dispatched = self.dispatcher.dispatch(&queries, models, observer).await;
        if dispatched.is_empty() {
            warn!("No selected model could be dispatched to");
        }

        self.evaluator
            .evaluate(items, mode, &dispatched, observer)
            .await
    }

    /// Run the pipeline and write one JSON row per item to `output_path`.
    pub async fn run(
        &self,
        items: &[EvalItem],
        models: &[String],
        output_path: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<RunStats> {
        let start = Instant::now();
        let mode = EvaluationMode::detect(items);

        info!(
            items = items.len(),
            models = models.len(),
            mode = ?mode,
            judge_concurrency = self.evaluator.concurrency(),
            "Starting evaluation pipeline"
        );

        let output_file =
            File::create(output_path).map_err(|e| EvalmuxError::io("creating output file", e))?;
        let mut writer = BufWriter::new(output_file);

        let rows = self.evaluate(items, models, observer).await;

        let mut stats = RunStats {
            total_items: items.len(),
            total_models: self.dispatcher.resolvable_models(models).len(),
            ..RunStats::default()
        };
        stats.total_answers = stats.total_items * stats.total_models;

        for row in &rows {
            if !row.verdicts.is_empty() {
                stats.total_judged += 1;
            }
            if row.fallback {
                stats.total_fallback += 1;
            }
            if row.unparsed {
                stats.total_unparsed += 1;
            }

            let json = serde_json::to_string(row).map_err(|e| {
                EvalmuxError::Internal(format!("Failed to serialize row: {}", e))
            })?;
            writeln!(writer, "{}", json).map_err(|e| EvalmuxError::io("writing output", e))?;
        }

        writer
            .flush()
            .map_err(|e| EvalmuxError::io("flushing output", e))?;

        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        info!(
            judged = stats.total_judged,
            fallback = stats.total_fallback,
            unparsed = stats.total_unparsed,
            throughput = format!("{:.0}/hr", stats.throughput_per_hour),
            "Evaluation pipeline complete"
        );

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn load_items_skips_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"query":"What is 2+2?","type":"math","answer":"4"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"query":"Describe Rust"}}"#).unwrap();

        let items = EvaluationPipeline::load_items(file.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].reference.as_deref(), Some("4"));
        assert_eq!(EvaluationMode::detect(&items), EvaluationMode::Objective);
    }

    #[test]
    fn load_items_reports_line_number() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"query":"ok"}}"#).unwrap();
        writeln!(file, r#"{{"type":"no query"}}"#).unwrap();

        let err = EvaluationPipeline::load_items(file.path()).unwrap_err();
        assert!(matches!(err, EvalmuxError::ParseError(msg) if msg.starts_with("Line 2")));
    }
}
