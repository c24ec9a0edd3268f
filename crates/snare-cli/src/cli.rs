use std::path::PathBuf;

/// The Snare instrumenter.
#[derive(clap::Parser)]
#[clap(version)]
pub struct CliOpts {
    /// The command to run.
    #[clap(subcommand)]
    pub action: CliAction,
}

/// The command to run.
#[derive(clap::Subcommand)]
pub enum CliAction {
    /// Command to find a running process, attach to it and hook functions of
    /// one of its modules.
    ///
    /// Runs until the process exits, or until interrupted (Ctrl-C), which
    /// detaches from the process and leaves it running.
    Attach {
        /// Instrumentation configuration (KDL format).
        ///
        /// If it ends with `.kdl`, it is treated as a path to a configuration
        /// file. Otherwise it is directly parsed as inline KDL-formatted
        /// configuration.
        #[clap(short, long, value_name = "CONTENT/PATH")]
        config: String,

        /// Path where to store the messages of the instrumentation session.
        #[clap(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    ///
    /// # Warning
    ///
    /// Exits on error.
    pub fn parse_from_cmdline() -> Self {
        <Self as clap::Parser>::parse()
    }
}
