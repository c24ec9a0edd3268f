use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use snare_engine::backend::{Fault, FaultKind};

/// Error returned by the ptrace backend.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// File open/read/write error.
    #[error("{0}: {1}")]
    File(std::path::PathBuf, std::io::Error),

    /// Unexpected `waitpid` status.
    #[error("bad wait status: {0:?}")]
    BadWait(WaitStatus),

    /// OS error.
    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    /// Short read or write of the process memory.
    #[error("memory read/write {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),

    /// The process doesn't exist.
    #[error("no such process: {0}")]
    NoSuchProcess(u64),

    /// The tracer thread of the process is gone.
    #[error("tracer of process {0} is gone")]
    TracerGone(u64),

    /// An interceptor is already installed at the given address.
    #[error("interceptor already at {0:#x}")]
    TrapExists(u64),

    /// No interceptor is installed at the given address.
    #[error("no interceptor at {0:#x}")]
    NoTrap(u64),

    /// A line of `/proc/<pid>/maps` couldn't be parsed.
    #[error("malformed maps line: {0:?}")]
    MalformedMaps(String),
}

impl Fault for Error {
    fn kind(&self) -> FaultKind {
        match self {
            Self::Os(Errno::EPERM | Errno::EACCES) => FaultKind::PermissionDenied,
            Self::Os(Errno::ESRCH) | Self::NoSuchProcess(_) | Self::TracerGone(_) => {
                FaultKind::ProcessExited
            }
            Self::Io(e) | Self::File(_, e) => io_fault(e),
            _ => FaultKind::Other,
        }
    }
}

fn io_fault(e: &std::io::Error) -> FaultKind {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => FaultKind::PermissionDenied,
        std::io::ErrorKind::NotFound => FaultKind::ProcessExited,
        _ if e.raw_os_error() == Some(Errno::ESRCH as i32) => FaultKind::ProcessExited,
        _ => FaultKind::Other,
    }
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
