//! Core data models for evalmux.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with fallback strategies

mod config;
mod descriptor;
mod error;
mod judgment;
mod progress;
mod query;

pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use judgment::*;
pub use progress::*;
pub use query::*;
