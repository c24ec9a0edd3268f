use crate::address::{Address, Offset};
use crate::backend::{Fault, FaultKind};
use crate::session::SessionState;

/// Boxed error coming from a backend implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Attaching to a process failed.
    #[error(transparent)]
    Attach(#[from] AttachError),

    /// Installing a hook failed.
    #[error(transparent)]
    Install(#[from] InstallError),

    /// The module wasn't found within the attached process.
    #[error("module {0} not found")]
    ModuleNotFound(String),

    /// The operation is not allowed in the current session state.
    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        /// Name of the rejected operation.
        operation: &'static str,

        /// State of the session when the operation was attempted.
        state: SessionState,
    },

    /// The attached process has exited.
    #[error("process {0} exited")]
    ProcessExited(u64),

    /// No hook of this session is installed at this address.
    #[error("no hook installed at {0}")]
    HookNotFound(Address),

    /// The control channel is closed.
    #[error(transparent)]
    ChannelClosed(#[from] crate::channel::ChannelClosed),

    /// A prologue pattern couldn't be parsed.
    #[error(transparent)]
    Pattern(#[from] crate::pattern::PatternError),

    /// An offset couldn't be parsed.
    #[error(transparent)]
    Offset(#[from] crate::address::ParseOffsetError),

    /// Backend error.
    #[error("backend error: {0}")]
    Backend(#[source] BoxError),
}

impl Error {
    /// Converts a backend error raised while operating on process `pid`.
    pub(crate) fn from_fault<E: Fault>(pid: u64, e: E) -> Self {
        match e.kind() {
            FaultKind::ProcessExited => Self::ProcessExited(pid),
            FaultKind::PermissionDenied | FaultKind::Other => Self::Backend(Box::new(e)),
        }
    }
}

/// Error returned when attaching to a process.
///
/// All kinds are recoverable: the caller is expected to move on to the next
/// candidate process.
#[derive(thiserror::Error, Debug)]
pub enum AttachError {
    /// The OS refused the attachment.
    #[error("permission denied for process {pid}")]
    PermissionDenied {
        /// Process ID.
        pid: u64,

        /// Backend error.
        #[source]
        source: BoxError,
    },

    /// The process exited before (or while) attaching.
    #[error("process {pid} exited")]
    ProcessExited {
        /// Process ID.
        pid: u64,
    },

    /// A session is already attached to the process.
    #[error("process {pid} is already attached")]
    AlreadyAttached {
        /// Process ID.
        pid: u64,
    },

    /// Backend error.
    #[error("attaching to process {pid} failed")]
    Backend {
        /// Process ID.
        pid: u64,

        /// Backend error.
        #[source]
        source: BoxError,
    },
}

impl AttachError {
    pub(crate) fn from_fault<E: Fault>(pid: u64, e: E) -> Self {
        match e.kind() {
            FaultKind::PermissionDenied => Self::PermissionDenied {
                pid,
                source: Box::new(e),
            },
            FaultKind::ProcessExited => Self::ProcessExited { pid },
            FaultKind::Other => Self::Backend {
                pid,
                source: Box::new(e),
            },
        }
    }
}

/// Error returned when installing a hook.
#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    /// The hooked address doesn't look like a function entry.
    #[error("implausible hook target at {address}: {reason}")]
    ImplausibleTarget {
        /// Absolute address (or the module base if it couldn't be resolved).
        address: Address,

        /// Why the target was rejected.
        reason: Implausibility,
    },

    /// A hook is already installed at this address in this session.
    #[error("a hook is already installed at {address}")]
    AlreadyInstalled {
        /// Absolute address of the existing hook.
        address: Address,
    },

    /// The process exited during the installation.
    #[error("process exited while hooking {address}")]
    TargetUnreachable {
        /// Absolute address of the hook.
        address: Address,
    },
}

/// Reason for rejecting a hook target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Implausibility {
    /// The offset points outside of the module.
    OutOfModule {
        /// Relative offset of the hook.
        offset: Offset,

        /// Size of the module.
        module_size: u64,
    },

    /// The hook descriptor has no prologue pattern to validate against.
    NoPrologues,

    /// None of the prologue patterns matched.
    PrologueMismatch {
        /// Bytes found at the target address.
        found: Vec<u8>,
    },

    /// The target bytes couldn't be read.
    Unreadable,
}

impl std::fmt::Display for Implausibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfModule {
                offset,
                module_size,
            } => write!(f, "offset {offset} is outside of the module ({module_size:#x} bytes)"),
            Self::NoPrologues => f.write_str("no prologue pattern to validate against"),
            Self::PrologueMismatch { found } => {
                f.write_str("no prologue pattern matches bytes [")?;
                for (i, b) in found.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{b:02X}")?;
                }
                f.write_str("]")
            }
            Self::Unreadable => f.write_str("target bytes are unreadable"),
        }
    }
}

/// Error returned by a [CallFrame](crate::backend::CallFrame) operation.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    /// The argument isn't part of the hook's argument layout, or the
    /// backend cannot reach it.
    #[error("argument #{0} is unavailable")]
    ArgumentUnavailable(usize),

    /// Target memory couldn't be accessed.
    #[error("cannot access {len} bytes at {address}")]
    Memory {
        /// Accessed address.
        address: Address,

        /// Number of accessed bytes.
        len: usize,

        /// Backend error.
        #[source]
        source: Option<BoxError>,
    },
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
