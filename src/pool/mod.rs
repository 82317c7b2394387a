//! Pool module - fan-out dispatcher and judge evaluator.

mod dispatcher;
mod evaluator;

pub use dispatcher::*;
pub use evaluator::*;
