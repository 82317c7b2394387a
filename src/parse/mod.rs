//! Salvage parsing of judge output.

mod repair;
mod salvage;

pub use repair::*;
pub use salvage::*;
