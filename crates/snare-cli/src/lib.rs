//! Crate implementing the CLI commands.

mod cli;
mod config;
mod run;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{ArgConfig, AttachConfig, HookConfig, PrologueConfig, RetryConfig};
pub use self::run::evaluate_attach;
