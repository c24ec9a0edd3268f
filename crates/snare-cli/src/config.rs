use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use miette::IntoDiagnostic;
use snare_engine::{HookDescriptor, Interpretation, Offset, Pattern, RetryPolicy};

/// Configuration of an instrumentation session.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct AttachConfig {
    /// Case-insensitive substring of the target process name.
    #[knus(child, unwrap(argument))]
    pub process: String,

    /// File name of the module to hook (exact match).
    #[knus(child, unwrap(argument))]
    pub module: String,

    /// Maximum number of candidate processes polled at once.
    #[knus(child, default = 4, unwrap(argument))]
    pub parallelism: usize,

    /// Polling of the module.
    #[knus(child, default)]
    pub retry: RetryConfig,

    /// Functions to hook.
    #[knus(children(name = "hook"))]
    pub hooks: Vec<HookConfig>,
}

/// Configuration of module polling.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    #[knus(property, default = 40)]
    pub max_attempts: u32,

    /// Delay between attempts, in milliseconds.
    #[knus(property, default = 250)]
    pub interval_ms: u64,

    /// Overall polling deadline, in milliseconds.
    #[knus(property, default = 20_000)]
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            interval_ms: 250,
            timeout_ms: 20_000,
        }
    }
}

impl RetryConfig {
    /// Returns the corresponding polling policy.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.timeout_ms),
        )
    }
}

/// Configuration of a function hook.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct HookConfig {
    /// Offset of the function within the module (hex or decimal).
    #[knus(argument, str)]
    pub offset: Offset,

    /// Name of the function.
    #[knus(property)]
    pub name: Option<String>,

    /// Plausible first bytes of the function.
    #[knus(children(name = "prologue"))]
    pub prologues: Vec<PrologueConfig>,

    /// Arguments to capture.
    #[knus(children(name = "arg"))]
    pub args: Vec<ArgConfig>,
}

/// Plausible first bytes of a hooked function (e.g., `"55 48 89 E5"`).
#[derive(Debug, PartialEq, knus::Decode)]
pub struct PrologueConfig {
    /// Byte pattern, `??` being a wildcard.
    #[knus(argument, str)]
    pub pattern: Pattern,
}

/// Argument captured by a hook.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ArgConfig {
    /// Position in the calling convention.
    #[knus(argument)]
    pub index: usize,

    /// Type of the argument (e.g., `"u32"`, `"pointer"`).
    #[knus(argument, str)]
    pub interpretation: Interpretation,
}

impl HookConfig {
    /// Returns the corresponding hook description.
    pub fn descriptor(&self) -> HookDescriptor {
        let descriptor = HookDescriptor::new(self.offset);

        let descriptor = match &self.name {
            Some(name) => descriptor.named(name),
            None => descriptor,
        };

        let descriptor = self
            .prologues
            .iter()
            .fold(descriptor, |d, p| d.prologue(p.pattern.clone()));

        self.args
            .iter()
            .fold(descriptor, |d, a| d.argument(a.index, a.interpretation))
    }
}

/// Decodes the configuration, either inline or from a `.kdl` file.
pub fn parse_attach_config(config: &str) -> miette::Result<AttachConfig> {
    let path = Path::new(config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", config)?
    };

    Ok(config)
}
