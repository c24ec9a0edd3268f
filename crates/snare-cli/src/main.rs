#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use snare_cli::{CliAction, CliOpts};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .with_env_var("SNARE_LOG")
                .from_env_lossy(),
        )
        .init();

    let res = match cli.action {
        CliAction::Attach { config, output } => snare_cli::evaluate_attach(config, output),
    };

    if let Err(e) = res {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
