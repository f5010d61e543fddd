//! CLI command handling

pub mod output;

pub use output::*;
