//! CLI module
//!
//! Command-line interface of the `msc` binary.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command};
pub use config::{load_config, overrides_from_args};
pub use progress::ProgressDisplay;
