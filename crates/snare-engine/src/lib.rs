//! This crate allows to attach to a running process, locate a function
//! within one of its modules, and intercept every call to it.
//!
//! Four steps are involved:
//! - Finding candidate processes by name (or arbitrary predicate).
//! - Attaching an instrumentation [Session] to a candidate, and verifying
//!   that the target module is loaded (its base address is unknown
//!   beforehand).
//! - Installing entry hooks at module-relative offsets. The bytes found at
//!   the resolved address must look like a function prologue, otherwise
//!   nothing is installed.
//! - Exchanging messages with the controller over the session's control
//!   [channel].
//!
//! # Hooking a function
//!
//! ```no_run
//! use snare_engine::backend::Backend;
//! use snare_engine::channel::{ChannelEvent, Message};
//! use snare_engine::{HookDescriptor, Instrumenter, Interpretation, RetryPolicy};
//!
//! async fn run<B: Backend>(backend: B) -> snare_engine::Result<()> {
//!     let instrumenter = Instrumenter::new(backend);
//!
//!     // attach to the first "game" process which loaded "libgame.so"
//!     let Some(mut session) = instrumenter
//!         .discover("game", "libgame.so", &RetryPolicy::default(), 4)
//!         .await?
//!     else {
//!         return Ok(());
//!     };
//!
//!     let mut events = session.load_payload()?;
//!
//!     let descriptor = HookDescriptor::new("0x1a2b30".parse()?)
//!         .named("update_score")
//!         .argument(0, Interpretation::Pointer)
//!         .argument(1, Interpretation::U32)
//!         .prologue("55 48 89 E5".parse()?);
//!
//!     session
//!         .install(descriptor, |invocation| {
//!             // double every score update
//!             if let Some(delta) = invocation.argument(1).map(|arg| arg.value()) {
//!                 let _ = invocation.set_argument(1, delta * 2);
//!             }
//!
//!             let _ = invocation.report();
//!         })
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ChannelEvent::Message(Message::Event { arguments, .. }) => {
//!                 //
//!                 // consume the intercepted call
//!                 //
//!             }
//!             ChannelEvent::Message(_) => (),
//!             ChannelEvent::Closed(_) => break,
//!         }
//!     }
//!
//!     session.detach()
//! }
//! ```
//!
//! # Implementing a backend
//!
//! The [Backend](self::backend::Backend)/[Target](self::backend::Target)
//! traits implement the platform-specific logic (enumerating processes,
//! attaching, reading memory, patching code). The default Linux backend is
//! provided by `snare-ptrace`.

mod address;

/// Module containing traits for implementing a platform backend.
pub mod backend;

/// Module implementing the control channel.
pub mod channel;

mod error;
mod hook;
mod module;
mod pattern;
mod process;
mod session;

pub use self::address::{Address, Offset, ParseOffsetError, ResolvedAddress};
pub use self::error::{
    AttachError, BoxError, Error, FrameError, Implausibility, InstallError, Result,
};
pub use self::hook::{
    Argument, ArgumentSpec, HookDescriptor, InstallHandle, InterceptionEvent, Interpretation,
    Invocation, OnEnter, ParseInterpretationError,
};
pub use self::module::{ModuleInfo, RetryPolicy};
pub use self::pattern::{Pattern, PatternError};
pub use self::process::{Candidates, ProcessFilter, ProcessHandle, find_candidates};
pub use self::session::{ControllerEndpoint, Instrumenter, PayloadEndpoint, Session, SessionState};
