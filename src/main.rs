//! evalmux CLI - Multi-provider query dispatch and judge-backed evaluation.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use evalmux::client::JudgeBackend;
use evalmux::models::LabelStyle;
use evalmux::parse::salvage;
use evalmux::{
    Config, CredentialStore, Dispatcher, EnvCredentials, EvaluationPipeline, IndicatifProgress,
    ModelCatalog, ReliableJudgeClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "evalmux")]
#[command(author = "Infernet <dev@infernet.org>")]
#[command(version)]
#[command(about = "Multi-provider query dispatch and judge-backed evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (built-in defaults if missing)
    #[arg(short, long, global = true, default_value = "evalmux.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalogued models and whether their credentials are configured
    Models,

    /// Validate configuration and, optionally, a model selection
    Validate {
        /// Models to check (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        models: Vec<String>,
    },

    /// Show example configuration
    Example,

    /// Send every query to every selected model and print the answers as JSON
    Dispatch {
        /// File with one query per line
        #[arg(short, long)]
        queries: PathBuf,

        /// Models to query (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        models: Vec<String>,

        /// Write JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send a prompt file to the judge and show the raw and salvaged output
    Judge {
        /// File containing the evaluation prompt
        #[arg(short, long)]
        prompt: PathBuf,
    },

    /// Dispatch items, judge the answers and write one JSON row per item
    Evaluate {
        /// Path to input items JSONL file
        #[arg(short, long)]
        items: PathBuf,

        /// Models to evaluate (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        models: Vec<String>,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Label participants 模型1, 模型2, ... and prompt in Chinese
        #[arg(long)]
        chinese: bool,

        /// Run even if some selected models are unknown or lack credentials
        #[arg(long)]
        skip_validation: bool,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# evalmux configuration file

[dispatch]
max_concurrency = 5     # fetches in flight per dispatch call
per_host_limit = 10     # fetches in flight per backend host
timeout_secs = 60

[judge]
model = "gemini-pro"
max_attempts = 3
retry_base_delay_ms = 1000   # 429 backoff, doubled per attempt
retry_delay_ms = 1000        # other retryable failures
temperature = 0.1
top_k = 1
top_p = 0.8
max_output_tokens = 4096
timeout_secs = 60
concurrency = 3
neutral_score = 3

# Extra backends. Entries replace built-in models of the same name.
# replace_builtin_models = true   # use only the models below

[[models]]
name = "local-chat"
family = "event_stream"
endpoint = "http://localhost:8080/goapi/v1/chat/stream"
credential_key = "LOCAL_CHAT_KEY"
headers = { Accept = "text/event-stream", "Content-Type" = "application/json" }

[[models]]
name = "local-writer"
family = "delta_stream"
endpoint = "http://localhost:8081/copilot/api/instruction/completion"
model_id = "HKGAI-V1"
credential_key = "LOCAL_WRITER_COOKIE"
headers = { "Content-Type" = "application/json", "X-App-Id" = "${LOCAL_APP_ID}" }

[models.template]
kind = "instruction"
key = "common_writing"

[[models.template.parameters]]
key = "user_instruction"
value = "{prompt}"

[[models.template.parameters]]
key = "with_search"
value = "false"
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("Failed to load config from {path:?}"))?;
    if !path.exists() {
        info!(path = ?path, "No config file, using built-in defaults");
    }
    Ok(config)
}

fn read_queries(path: &Path) -> Result<Vec<String>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path:?}"))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let credentials: Arc<dyn CredentialStore> = Arc::new(EnvCredentials);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Models => {
            let config = load_config(&cli.config)?;
            let catalog = ModelCatalog::from_config(&config);

            println!("{:<26} {:<14} {:<24} AVAILABLE", "MODEL", "FAMILY", "CREDENTIAL");
            for m in catalog.available_models(credentials.as_ref()) {
                println!(
                    "{:<26} {:<14} {:<24} {}",
                    m.name,
                    m.family.to_string(),
                    m.credential_key,
                    if m.available { "yes" } else { "no" }
                );
            }
        }

        Commands::Validate { models } => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
            let catalog = ModelCatalog::from_config(&config);

            catalog
                .validate_model(&config.judge.model, credentials.as_ref())
                .context("Judge model is not usable")?;
            catalog
                .validate_models(&models, credentials.as_ref())
                .context("Model selection is not usable")?;

            info!("Configuration is valid");
            info!("  Catalog: {} models", catalog.len());
            info!(
                "  Dispatch: {} in flight, {} per host, {}s timeout",
                config.dispatch.max_concurrency,
                config.dispatch.per_host_limit,
                config.dispatch.timeout_secs
            );
            info!(
                "  Judge: {} ({} attempts, {} concurrent)",
                config.judge.model, config.judge.max_attempts, config.judge.concurrency
            );
            return Ok(());
        }

        Commands::Dispatch {
            queries,
            models,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let catalog = Arc::new(ModelCatalog::from_config(&config));
            let dispatcher =
                Dispatcher::with_provider(catalog, Arc::clone(&credentials), config.dispatch)?;

            let queries = read_queries(&queries)?;
            let progress = IndicatifProgress::new();
            let result = dispatcher.dispatch(&queries, &models, &progress).await;
            progress.finish(format!("{} models answered", result.len()));

            let json = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write {path:?}"))?,
                None => println!("{json}"),
            }
        }

        Commands::Judge { prompt } => {
            let config = load_config(&cli.config)?;
            let catalog = ModelCatalog::from_config(&config);
            let judge = ReliableJudgeClient::from_catalog(
                &catalog,
                Arc::clone(&credentials),
                config.judge,
            )?;

            let prompt = std::fs::read_to_string(&prompt)
                .with_context(|| format!("Failed to read {prompt:?}"))?;
            let raw = judge.judge(&prompt).await;
            let outcome = salvage(&raw);

            println!("=== Raw ===\n{raw}\n");
            println!("=== Salvaged ({:?}) ===", outcome.stage);
            println!("{}", serde_json::to_string_pretty(&outcome.value)?);
        }

        Commands::Evaluate {
            items,
            models,
            output,
            chinese,
            skip_validation,
        } => {
            let config = load_config(&cli.config)?;
            let catalog = Arc::new(ModelCatalog::from_config(&config));

            if models.is_empty() {
                bail!("Select at least one model");
            }
            if let Err(e) = catalog.validate_models(&models, credentials.as_ref()) {
                if skip_validation {
                    warn!(error = %e, "Continuing despite invalid model selection");
                } else {
                    return Err(e).context("Model selection is not usable");
                }
            }

            let style = if chinese {
                LabelStyle::Chinese
            } else {
                LabelStyle::English
            };
            let pipeline =
                EvaluationPipeline::new(&config, catalog, Arc::clone(&credentials), style)?;
            let items_data = EvaluationPipeline::load_items(&items)?;

            let progress = IndicatifProgress::new();
            let stats = pipeline
                .run(&items_data, &models, &output, &progress)
                .await?;
            progress.finish("Done!");

            println!("\n=== Evaluation Complete ===");
            println!("Items:       {}", stats.total_items);
            println!("Models:      {}", stats.total_models);
            println!("Answers:     {}", stats.total_answers);
            println!("Judged:      {}", stats.total_judged);
            println!("Fallback:    {}", stats.total_fallback);
            println!("Unparsed:    {}", stats.total_unparsed);
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Runtime:     {:.1}s", stats.runtime_secs);
            println!("Output:      {output:?}");
        }
    }

    Ok(())
}
