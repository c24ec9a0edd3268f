use std::path::PathBuf;

use futures_util::SinkExt;
use miette::IntoDiagnostic;
use snare_engine::channel::{ChannelEvent, CloseReason, LogLevel, Message, MessageCodec};
use snare_engine::{ControllerEndpoint, InstallHandle, Instrumenter, Invocation, Session};
use snare_ptrace::{Ptrace, PtraceTarget};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio_util::codec::FramedWrite;

use crate::config::{AttachConfig, parse_attach_config};

/// Runs the subcommand for attaching to a process and hooking it.
pub fn evaluate_attach(config: String, output: Option<PathBuf>) -> miette::Result<()> {
    let config = parse_attach_config(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(attach_and_hook(config, output))
}

async fn attach_and_hook(config: AttachConfig, output: Option<PathBuf>) -> miette::Result<()> {
    // registered first, so that an early Ctrl-C doesn't leave traps behind
    let mut interrupt = interrupt_signal().into_diagnostic()?;

    let mut output = match output {
        Some(path) => {
            let file = tokio::fs::File::create(path).await.into_diagnostic()?;
            Some(FramedWrite::new(file, MessageCodec::<Message>::new()))
        }
        None => None,
    };

    let Some(setup) = unless_interrupted(&mut interrupt, hook_process(&config)).await else {
        tracing::info!("interrupted before the hooks were installed");
        return Ok(());
    };

    let (mut session, mut controller, handles) = setup?;

    let mut detaching = false;

    let reason = loop {
        tokio::select! {
            event = controller.recv() => match event {
                Some(ChannelEvent::Message(message)) => {
                    log_message(&message);

                    if let Some(output) = &mut output {
                        output.send(message).await.into_diagnostic()?;
                    }
                }
                Some(ChannelEvent::Closed(reason)) => break reason,
                None => break CloseReason::EndpointDropped,
            },

            _ = interrupt.recv(), if !detaching => {
                tracing::info!("interrupted, detaching");

                detaching = true;
                session.detach().into_diagnostic()?;
            }
        }
    };

    for (label, handle) in &handles {
        tracing::info!(hook = label, hits = handle.hits(), "hook summary");
    }

    if let Some(output) = &mut output {
        output.close().await.into_diagnostic()?;
    }

    match reason {
        CloseReason::TargetExited(exit) => tracing::info!(%exit, "process exited"),
        reason => tracing::info!(?reason, "session closed"),
    }

    Ok(())
}

type Hooks = Vec<(String, InstallHandle)>;

/// Attaches to the target process and installs the configured hooks.
///
/// Dropping the returned future detaches from the process.
async fn hook_process(
    config: &AttachConfig,
) -> miette::Result<(Session<PtraceTarget>, ControllerEndpoint, Hooks)> {
    let instrumenter = Instrumenter::new(Ptrace);

    let Some(mut session) = instrumenter
        .discover(
            config.process.as_str(),
            &config.module,
            &config.retry.policy(),
            config.parallelism,
        )
        .await
        .into_diagnostic()?
    else {
        miette::bail!(
            "no process matching {:?} loaded module {:?}",
            config.process,
            config.module
        );
    };

    tracing::info!(
        pid = session.process().pid(),
        name = session.process().name(),
        "attached"
    );

    let controller = session.load_payload().into_diagnostic()?;

    let mut handles = Vec::with_capacity(config.hooks.len());

    for hook in &config.hooks {
        let descriptor = hook.descriptor();
        let label = descriptor.label();

        let handle = session
            .install(descriptor, |invocation: &mut Invocation<'_>| {
                // the controller side may be gone already
                let _ = invocation.report();
            })
            .await
            .into_diagnostic()?;

        handles.push((label, handle));
    }

    Ok((session, controller, handles))
}

fn interrupt_signal() -> std::io::Result<Signal> {
    signal(SignalKind::interrupt())
}

/// Runs `future`, unless an interrupt signal is received first.
async fn unless_interrupted<F: Future>(interrupt: &mut Signal, future: F) -> Option<F::Output> {
    tokio::select! {
        output = future => Some(output),
        _ = interrupt.recv() => None,
    }
}

fn log_message(message: &Message) {
    match message {
        Message::Ready { module, base } => {
            tracing::info!(module, base = format_args!("{base:#x}"), "ready");
        }
        Message::Hooked { name, address } => {
            tracing::info!(hook = name, address = format_args!("{address:#x}"), "hooked");
        }
        Message::Unhooked { address } => {
            tracing::info!(address = format_args!("{address:#x}"), "unhooked");
        }
        Message::Event {
            hook,
            thread_id,
            arguments,
            timestamp_us,
        } => {
            tracing::info!(
                hook,
                thread_id,
                arguments = ?HexList(arguments),
                timestamp_us,
                "call"
            );
        }
        Message::Log { level, text } => match level {
            LogLevel::Warn => tracing::warn!(target: "snare::payload", "{text}"),
            LogLevel::Info => tracing::info!(target: "snare::payload", "{text}"),
            LogLevel::Debug => tracing::debug!(target: "snare::payload", "{text}"),
        },
        Message::Error { text } => tracing::error!(target: "snare::payload", "{text}"),
        Message::Custom { tag, data } => {
            tracing::debug!(tag, len = data.len(), "custom message");
        }
    }
}

struct HexList<'a>(&'a [u64]);

impl std::fmt::Debug for HexList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.iter().map(|&v| Hex(v))).finish()
    }
}

struct Hex(u64);

impl std::fmt::Debug for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
