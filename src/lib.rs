//! evalmux - Multi-provider query dispatch and judge-backed evaluation.
//!
//! ## Architecture
//!
//! evalmux has two logical stages:
//! - **Dispatcher**: Sends every query to every selected backend concurrently
//!   and collects ordered answers, with failures recorded as answer text
//! - **Evaluator**: Asks a judge backend to score the answers and salvages a
//!   structured judgment from whatever text comes back
//!
//! ## Pipeline
//!
//! - **Evaluation Pipeline**: Load items → Dispatch → Judge → Output rows
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, backoff, synthesis)

pub mod client;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod pool;
pub mod prompts;

// Re-exports for convenience
pub use client::{
    AnswerFetcher, ConcurrencyGate, CredentialStore, EnvCredentials, JudgeBackend, ModelCatalog,
    ProviderClient, ReliableJudgeClient, StaticCredentials,
};
pub use models::{
    Config, DispatchResult, EvalItem, EvaluationMode, EvaluationRow, EvalmuxError,
    JudgmentRecord, ModelDescriptor, ProgressObserver, ProtocolFamily, Result, RunStats,
};
pub use pipeline::{EvaluationPipeline, IndicatifProgress};
pub use pool::{Dispatcher, Evaluator};
pub use prompts::PromptBuilder;
