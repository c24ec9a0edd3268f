use std::future::Future;
use std::sync::Arc;

use crate::address::{Address, ResolvedAddress};
use crate::error::FrameError;
use crate::module::ModuleInfo;
use crate::process::ProcessHandle;

/// Trait implementing the process discovery and attaching logic of a
/// platform.
pub trait Backend {
    /// Attached process returned by this backend.
    type Target: Target;

    /// Error returned by this trait.
    type Error: Fault;

    /// Returns a snapshot of the OS process table.
    ///
    /// Every call re-enumerates the processes.
    fn processes(&self) -> impl Future<Output = Result<Vec<ProcessHandle>, Self::Error>>;

    /// Attaches to the given process.
    ///
    /// The process keeps running once attached.
    fn attach(
        &self,
        process: &ProcessHandle,
    ) -> impl Future<Output = Result<Self::Target, Self::Error>>;
}

/// Trait implementing the instrumentation logic of an attached process.
pub trait Target {
    /// Error returned by this trait.
    type Error: Fault;

    /// Returns the ID of the attached process.
    fn process_id(&self) -> u64;

    /// Returns the modules currently loaded by the process.
    fn modules(&self) -> impl Future<Output = Result<Vec<ModuleInfo>, Self::Error>>;

    /// Reads data from the process' address space.
    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Installs an entry interceptor at the given address.
    ///
    /// Whenever a thread of the process reaches `addr`, the implementor
    /// suspends that thread, calls [Interceptor::on_enter], and resumes the
    /// original execution once it returns.
    fn intercept(
        &mut self,
        addr: ResolvedAddress,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), Self::Error>;

    /// Removes the entry interceptor at the given address.
    fn release(&mut self, addr: ResolvedAddress) -> Result<(), Self::Error>;

    /// Registers the function to call (once) when the process exits.
    fn on_exit(&mut self, notifier: ExitNotifier);

    /// Detaches from the process.
    ///
    /// # Note
    ///
    /// Interceptors still installed at this point are released by the
    /// implementor.
    fn detach(&mut self) -> Result<(), Self::Error>;
}

/// Entry interceptor called by a backend.
pub trait Interceptor: Send + Sync {
    /// Function called when a thread reaches the hooked address.
    ///
    /// It runs on the backend's thread of execution for the stopped thread,
    /// and may run concurrently with itself.
    fn on_enter(&self, frame: &mut dyn CallFrame);
}

/// View over an intercepted call, valid while the calling thread is
/// suspended.
pub trait CallFrame {
    /// Returns the ID of the thread which made the call.
    fn thread_id(&self) -> u64;

    /// Returns the raw value of the argument at the given index (calling
    /// convention order).
    fn argument(&self, index: usize) -> Result<u64, FrameError>;

    /// Sets the raw value of the argument at the given index.
    fn set_argument(&mut self, index: usize, value: u64) -> Result<(), FrameError>;

    /// Reads data from the process' address space.
    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<(), FrameError>;

    /// Writes data into the process' address space.
    fn write_memory(&mut self, addr: Address, buf: &[u8]) -> Result<(), FrameError>;
}

/// Function called when the attached process exits.
pub type ExitNotifier = Box<dyn FnOnce(ExitReason) + Send>;

/// Reason for which an attached process stopped existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited with the given code.
    Exited(i32),

    /// The process was terminated by the given signal.
    Signaled(i32),

    /// The process replaced its image (`execve`), unloading every module.
    Replaced,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            Self::Replaced => f.write_str("replaced its image"),
        }
    }
}

/// Classification of a backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The OS denied the operation.
    PermissionDenied,

    /// The process no longer exists.
    ProcessExited,

    /// Any other failure.
    Other,
}

/// Trait implemented by backend errors, so that the engine can tell expected
/// failures apart.
pub trait Fault: std::error::Error + Send + Sync + 'static {
    /// Returns the classification of this error.
    fn kind(&self) -> FaultKind;
}
