//! Fan-out dispatcher: every query to every selected model.
//!
//! Epistemic foundation:
//! - K_i: Answer `i` of each model answers query `i`, whatever the completion order
//! - K_i: One concurrency gate per call bounds all of its fetches
//! - B_i: Each fetch may fail → its error text takes the answer slot
//! - I^R: Unknown models are skipped rather than reported per query

use crate::client::{
    AnswerFetcher, ConcurrencyGate, CredentialStore, FetchContext, ModelCatalog, ProviderClient,
};
use crate::models::{DispatchConfig, DispatchResult, ProgressObserver, Result};
use futures::future::join_all;
use reqwest::header::HeaderMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Status text shown while answers are fetched.
pub const FETCHING_STATUS: &str = "Fetching model answers";

/// Sends a batch of queries to a set of models.
pub struct Dispatcher {
    catalog: Arc<ModelCatalog>,
    fetcher: Arc<dyn AnswerFetcher>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Create a dispatcher around an existing fetcher.
    pub fn new(
        catalog: Arc<ModelCatalog>,
        fetcher: Arc<dyn AnswerFetcher>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            config,
        }
    }

    /// Create a dispatcher backed by a [`ProviderClient`].
    pub fn with_provider(
        catalog: Arc<ModelCatalog>,
        credentials: Arc<dyn CredentialStore>,
        config: DispatchConfig,
    ) -> Result<Self> {
        let client = ProviderClient::new(
            Arc::clone(&catalog),
            credentials,
            config.timeout_secs,
            config.per_host_limit,
        )?;
        Ok(Self::new(catalog, Arc::new(client), config))
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Selected models that can be dispatched to, deduplicated, in selection order.
    pub fn resolvable_models<'a>(&self, models: &'a [String]) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        models
            .iter()
            .map(String::as_str)
            .filter(|name| seen.insert(*name))
            .filter(|name| {
                let dispatchable = self
                    .catalog
                    .resolve(name)
                    .is_some_and(|d| d.family.is_fan_out());
                if !dispatchable {
                    warn!(model = %name, "Skipping model that cannot be dispatched");
                }
                dispatchable
            })
            .collect()
    }

    /// Answer every query with every resolvable model.
    pub async fn dispatch(
        &self,
        queries: &[String],
        models: &[String],
        observer: &dyn ProgressObserver,
    ) -> DispatchResult {
        self.dispatch_with_overrides(queries, models, observer, &HeaderMap::new())
            .await
    }

    /// [`Dispatcher::dispatch`] with caller-supplied credential override headers.
    pub async fn dispatch_with_overrides(
        &self,
        queries: &[String],
        models: &[String],
        observer: &dyn ProgressObserver,
        overrides: &HeaderMap,
    ) -> DispatchResult {
        let selected = self.resolvable_models(models);
        let mut result = DispatchResult::new();
        if selected.is_empty() {
            return result;
        }

        observer.set_total(queries.len() * selected.len());
        observer.set_status(FETCHING_STATUS);

        let gate = ConcurrencyGate::new(self.config.max_concurrency, self.config.per_host_limit);
        let ctx = FetchContext {
            gate: &gate,
            observer,
            overrides,
        };
        let start = Instant::now();

        info!(
            queries = queries.len(),
            models = selected.len(),
            max_concurrency = gate.capacity(),
            "Dispatching"
        );

        let groups = selected.iter().map(|&model| {
            let ctx = &ctx;
            async move {
                let fetches = queries
                    .iter()
                    .map(|query| self.fetcher.fetch_answer(query, model, ctx));
                let answers = join_all(fetches).await;
                debug!(model = %model, answers = answers.len(), "Model group complete");
                (model, answers)
            }
        });

        for (model, answers) in join_all(groups).await {
            result.push(model, answers);
        }

        let stats = gate.stats();
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            requests = stats.total_acquired,
            peak_in_flight = stats.peak_in_flight,
            "Dispatch complete"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelDescriptor, NoopProgress, TaskProgress};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers `"<model>:<query>"`, finishing later queries first.
    struct EchoFetcher;

    #[async_trait]
    impl AnswerFetcher for EchoFetcher {
        async fn fetch_answer(&self, query: &str, model: &str, ctx: &FetchContext<'_>) -> String {
            let _permit = ctx.gate.acquire("echo:80").await.unwrap();
            let delay = 30u64.saturating_sub(query.len() as u64 * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            ctx.observer.increment();
            format!("{model}:{query}")
        }
    }

    fn dispatcher() -> Dispatcher {
        let catalog = ModelCatalog::from_descriptors([
            ModelDescriptor::event_stream("a", "http://echo/a", "KA"),
            ModelDescriptor::delta_stream("b", "http://echo/b", "B", "KB"),
            ModelDescriptor::judge("j", "http://echo/j", "j", "KJ"),
        ]);
        Dispatcher::new(Arc::new(catalog), Arc::new(EchoFetcher), DispatchConfig::default())
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn answers_keep_query_order() {
        let queries = strings(&["q", "qq", "qqq"]);
        let progress = TaskProgress::new();
        let result = dispatcher()
            .dispatch(&queries, &strings(&["b", "a"]), &progress)
            .await;

        assert_eq!(result.models(), vec!["b", "a"]);
        assert_eq!(result.get("a").unwrap(), &strings(&["a:q", "a:qq", "a:qqq"])[..]);
        assert_eq!(result.answer("b", 2), Some("b:qqq"));
        assert_eq!(progress.total(), 6);
        assert_eq!(progress.completed(), 6);
        assert_eq!(progress.snapshot().status, FETCHING_STATUS);
    }

    #[tokio::test]
    async fn unknown_and_judge_models_are_skipped() {
        let result = dispatcher()
            .dispatch(&strings(&["q"]), &strings(&["a", "missing", "j", "a"]), &NoopProgress)
            .await;
        assert_eq!(result.models(), vec!["a"]);
    }

    #[tokio::test]
    async fn nothing_resolvable_leaves_observer_untouched() {
        let progress = TaskProgress::new();
        let result = dispatcher()
            .dispatch(&strings(&["q"]), &strings(&["nonexistent-model"]), &progress)
            .await;
        assert!(result.is_empty());
        assert!(!progress.was_started());
        assert_eq!(progress.snapshot().status, "");
    }

    #[tokio::test]
    async fn empty_query_list_gives_empty_answer_lists() {
        let result = dispatcher()
            .dispatch(&[], &strings(&["a", "b"]), &NoopProgress)
            .await;
        assert_eq!(result.len(), 2);
        assert!(result.get("a").unwrap().is_empty());
    }
}
