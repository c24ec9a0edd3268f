mod error;
mod frame;
mod maps;
mod mem;
mod procfs;
mod tracer;
mod trap;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use snare_engine::backend::{Backend, ExitNotifier, Interceptor, Target};
use snare_engine::{Address, ModuleInfo, ProcessHandle, ResolvedAddress};

pub use self::error::{Error, Result};
use self::mem::ProcessMemory;
use self::tracer::{Request, Shared, Tracer};
use self::trap::TrapTable;

/// Maximum time given to the tracer thread to detach from every thread.
const DETACH_TIMEOUT: Duration = Duration::from_secs(5);

/// Linux backend, based on `ptrace(2)` and procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ptrace;

impl Backend for Ptrace {
    type Target = PtraceTarget;
    type Error = Error;

    async fn processes(&self) -> Result<Vec<ProcessHandle>> {
        procfs::processes().await
    }

    async fn attach(&self, process: &ProcessHandle) -> Result<PtraceTarget> {
        let pid = process.pid();

        if !procfs::exists(pid).await? {
            return Err(Error::NoSuchProcess(pid));
        }

        PtraceTarget::attach(pid).await
    }
}

/// Process traced by [Ptrace].
///
/// The threads of the process are traced by a dedicated OS thread, which also
/// runs the interceptors.
pub struct PtraceTarget {
    pid: u64,
    shared: Arc<Shared>,
    requests: Option<mpsc::Sender<Request>>,
    tracer: Option<JoinHandle<()>>,
}

impl PtraceTarget {
    #[tracing::instrument(name = "Attach", skip_all, fields(pid = pid))]
    async fn attach(pid: u64) -> Result<Self> {
        let memory = ProcessMemory::open(pid)?;
        let shared = Arc::new(Shared::new(TrapTable::new(memory)));

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let (requests, requests_rx) = mpsc::channel();

        let tracer = Tracer::new(pid, shared.clone());

        let handle = std::thread::Builder::new()
            .name(format!("snare-tracer-{pid}"))
            .spawn(move || tracer.run(ready_tx, requests_rx))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                pid,
                shared,
                requests: Some(requests),
                tracer: Some(handle),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::TracerGone(pid)),
        }
    }
}

impl Target for PtraceTarget {
    type Error = Error;

    fn process_id(&self) -> u64 {
        self.pid
    }

    async fn modules(&self) -> Result<Vec<ModuleInfo>> {
        procfs::modules(self.pid).await
    }

    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<()> {
        mem::read_process_memory(self.pid, addr.get(), buf)?;
        self.shared.traps().hide(addr.get(), buf);
        Ok(())
    }

    fn intercept(
        &mut self,
        addr: ResolvedAddress,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<()> {
        if self.shared.exit_reason().is_some() {
            return Err(Error::NoSuchProcess(self.pid));
        }

        self.shared
            .traps()
            .insert(addr.address().get(), interceptor)
    }

    fn release(&mut self, addr: ResolvedAddress) -> Result<()> {
        self.shared.traps().remove(addr.address().get())
    }

    fn on_exit(&mut self, notifier: ExitNotifier) {
        self.shared.set_exit_notifier(notifier);
    }

    fn detach(&mut self) -> Result<()> {
        let Some(requests) = self.requests.take() else {
            return Ok(());
        };

        self.shared.detached();

        if self.shared.exit_reason().is_some() {
            return Err(Error::NoSuchProcess(self.pid));
        }

        let restored = self.shared.traps().remove_all();

        let (reply_tx, reply_rx) = mpsc::channel();

        requests
            .send(Request::Detach(reply_tx))
            .map_err(|_| Error::TracerGone(self.pid))?;

        let detached = reply_rx
            .recv_timeout(DETACH_TIMEOUT)
            .map_err(|_| Error::TracerGone(self.pid))?;

        if let Some(tracer) = self.tracer.take() {
            if tracer.join().is_err() {
                tracing::error!(pid = self.pid, "tracer thread panicked");
            }
        }

        restored.and(detached)
    }
}

impl Drop for PtraceTarget {
    fn drop(&mut self) {
        if self.requests.is_some() {
            if let Err(e) = self.detach() {
                tracing::warn!(pid = self.pid, error = %e, "detach on drop");
            }
        }
    }
}
