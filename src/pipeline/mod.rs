//! Pipeline module - evaluation pipeline and terminal progress.

mod evaluate;
mod progress_bar;

pub use evaluate::*;
pub use progress_bar::*;
