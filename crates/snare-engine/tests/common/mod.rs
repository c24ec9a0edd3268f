//! In-memory backend simulating processes, their modules and their threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use snare_engine::backend::{
    Backend, CallFrame, ExitNotifier, ExitReason, Fault, FaultKind, Interceptor, Target,
};
use snare_engine::{
    Address, FrameError, ModuleInfo, Pattern, ProcessHandle, ResolvedAddress, RetryPolicy,
};

/// x86_64 `push rbp; mov rbp, rsp; sub rsp, 0x20`.
pub const PROLOGUE: [u8; 8] = [0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x20];

pub const MODULE: &str = "libgame.so";
pub const MODULE_BASE: u64 = 0x7f00_0000_0000;
pub const MODULE_SIZE: usize = 0x2000;

/// Offset of a function starting with [PROLOGUE].
pub const FUNCTION: u64 = 0x1a30;

/// Offset of some `int3` padding.
pub const PADDING: u64 = 0x1f00;

/// Address of a writable data region.
pub const HEAP: u64 = 0x5500_0000_0000;

pub fn prologue() -> Pattern {
    "55 48 89 E5".parse().unwrap()
}

/// Returns the code of the simulated module.
pub fn module_code() -> Vec<u8> {
    let mut code = vec![0xcc; MODULE_SIZE];
    code[FUNCTION as usize..][..PROLOGUE.len()].copy_from_slice(&PROLOGUE);
    code
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("operation not permitted")]
    PermissionDenied,

    #[error("no such process")]
    Gone,

    #[error("unmapped address {0:#x}")]
    Unmapped(u64),
}

impl Fault for SimError {
    fn kind(&self) -> FaultKind {
        match self {
            Self::PermissionDenied => FaultKind::PermissionDenied,
            Self::Gone => FaultKind::ProcessExited,
            Self::Unmapped(_) => FaultKind::Other,
        }
    }
}

struct SimModule {
    info: ModuleInfo,
    visible_after: u32,
}

#[derive(Default)]
struct ProcessState {
    alive: bool,
    attached: bool,
    deny_attach: bool,
    regions: Vec<(u64, Vec<u8>)>,
    modules: Vec<SimModule>,
    module_polls: u32,
    traps: HashMap<u64, Arc<dyn Interceptor>>,
    exit_notifier: Option<ExitNotifier>,
}

impl ProcessState {
    fn region(&self, addr: u64, len: usize) -> Option<(usize, usize)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, (base, bytes))| {
                let start = usize::try_from(addr.checked_sub(*base)?).ok()?;
                (start + len <= bytes.len()).then_some((i, start))
            })
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), SimError> {
        if !self.alive {
            return Err(SimError::Gone);
        }

        let (i, start) = self.region(addr, buf.len()).ok_or(SimError::Unmapped(addr))?;
        buf.copy_from_slice(&self.regions[i].1[start..][..buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), SimError> {
        if !self.alive {
            return Err(SimError::Gone);
        }

        let (i, start) = self.region(addr, data.len()).ok_or(SimError::Unmapped(addr))?;
        self.regions[i].1[start..][..data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Simulated process.
pub struct SimProcess {
    pid: u64,
    name: String,
    state: Mutex<ProcessState>,
}

impl SimProcess {
    pub fn new(pid: u64, name: &str) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: name.to_owned(),
            state: Mutex::new(ProcessState {
                alive: true,
                ..Default::default()
            }),
        })
    }

    /// Creates a process which loaded [MODULE] at [MODULE_BASE].
    pub fn with_game_module(pid: u64, name: &str) -> Arc<Self> {
        let process = Self::new(pid, name);
        process.load_module(MODULE, MODULE_BASE, module_code(), 0);
        process.map(HEAP, vec![0; 0x100]);
        process
    }

    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap()
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Maps a memory region.
    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.state().regions.push((base, bytes));
    }

    /// Loads a module, which only shows up in the module table once it was
    /// queried `visible_after` times.
    pub fn load_module(&self, name: &str, base: u64, code: Vec<u8>, visible_after: u32) {
        let mut state = self.state();

        state.modules.push(SimModule {
            info: ModuleInfo::new(name, Address::new(base), code.len() as u64),
            visible_after,
        });
        state.regions.push((base, code));
    }

    /// Unloads a module, and loads it again at another base address.
    pub fn reload_module(&self, name: &str, base: u64) {
        let mut state = self.state();

        let Some(module) = state.modules.iter_mut().find(|m| m.info.name() == name) else {
            panic!("module {name} not loaded");
        };

        let old_base = module.info.base().get();
        module.info = ModuleInfo::new(name, Address::new(base), module.info.size());

        for region in state.regions.iter_mut().filter(|(b, _)| *b == old_base) {
            region.0 = base;
        }
    }

    /// Unloads a module, unmapping its code.
    pub fn unload_module(&self, name: &str) {
        let mut state = self.state();

        let Some(position) = state.modules.iter().position(|m| m.info.name() == name) else {
            panic!("module {name} not loaded");
        };

        let base = state.modules.remove(position).info.base().get();
        state.regions.retain(|(b, _)| *b != base);
    }

    pub fn deny_attach(&self) {
        self.state().deny_attach = true;
    }

    pub fn module_polls(&self) -> u32 {
        self.state().module_polls
    }

    pub fn is_attached(&self) -> bool {
        self.state().attached
    }

    pub fn trap_count(&self) -> usize {
        self.state().traps.len()
    }

    /// Returns the interceptor installed at `addr`, if any.
    pub fn interceptor_at(&self, addr: u64) -> Option<Arc<dyn Interceptor>> {
        self.state().traps.get(&addr).cloned()
    }

    /// Simulates a call made by thread `tid` to the function at `addr`.
    ///
    /// Returns whether the call was intercepted.
    pub fn call(&self, tid: u64, addr: u64, args: &mut [u64]) -> bool {
        let Some(interceptor) = self.interceptor_at(addr) else {
            return false;
        };

        self.dispatch(interceptor.as_ref(), tid, args);
        true
    }

    /// Runs an interceptor as if thread `tid` reached it.
    pub fn dispatch(&self, interceptor: &dyn Interceptor, tid: u64, args: &mut [u64]) {
        let mut frame = SimFrame {
            process: self,
            thread_id: tid,
            args,
        };

        interceptor.on_enter(&mut frame);
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0; 4];
        self.state().read(addr, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(&self, addr: u64, value: u32) {
        self.state().write(addr, &value.to_le_bytes()).unwrap();
    }

    /// Terminates the process, and notifies the attached session.
    pub fn kill(&self, code: i32) {
        let notifier = {
            let mut state = self.state();
            state.alive = false;
            state.traps.clear();
            state.exit_notifier.take()
        };

        if let Some(notifier) = notifier {
            notifier(ExitReason::Exited(code));
        }
    }

    /// Terminates the process without notifying the attached session yet.
    pub fn vanish(&self) {
        self.state().alive = false;
    }
}

/// Simulated platform backend.
#[derive(Clone, Default)]
pub struct SimBackend {
    processes: Arc<Mutex<Vec<Arc<SimProcess>>>>,
}

impl SimBackend {
    pub fn new(processes: impl IntoIterator<Item = Arc<SimProcess>>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(processes.into_iter().collect())),
        }
    }

    pub fn spawn(&self, process: Arc<SimProcess>) {
        self.processes.lock().unwrap().push(process);
    }
}

impl Backend for SimBackend {
    type Target = SimTarget;
    type Error = SimError;

    async fn processes(&self) -> Result<Vec<ProcessHandle>, Self::Error> {
        // the OS doesn't return processes in PID order
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|p| p.state().alive)
            .map(|p| ProcessHandle::new(p.pid, p.name.clone()))
            .collect())
    }

    async fn attach(&self, process: &ProcessHandle) -> Result<Self::Target, Self::Error> {
        let target = self
            .processes
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.pid == process.pid())
            .cloned()
            .ok_or(SimError::Gone)?;

        {
            let mut state = target.state();

            if !state.alive {
                return Err(SimError::Gone);
            }

            if state.deny_attach {
                return Err(SimError::PermissionDenied);
            }

            state.attached = true;
        }

        tokio::task::yield_now().await;

        Ok(SimTarget { process: target })
    }
}

/// Attached simulated process.
pub struct SimTarget {
    process: Arc<SimProcess>,
}

impl Target for SimTarget {
    type Error = SimError;

    fn process_id(&self) -> u64 {
        self.process.pid
    }

    async fn modules(&self) -> Result<Vec<ModuleInfo>, Self::Error> {
        let mut state = self.process.state();

        if !state.alive {
            return Err(SimError::Gone);
        }

        state.module_polls += 1;
        let polls = state.module_polls;

        Ok(state
            .modules
            .iter()
            .filter(|m| polls > m.visible_after)
            .map(|m| m.info.clone())
            .collect())
    }

    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.process.state().read(addr.get(), buf)
    }

    fn intercept(
        &mut self,
        addr: ResolvedAddress,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), Self::Error> {
        let mut state = self.process.state();

        if !state.alive {
            return Err(SimError::Gone);
        }

        state.traps.insert(addr.address().get(), interceptor);
        Ok(())
    }

    fn release(&mut self, addr: ResolvedAddress) -> Result<(), Self::Error> {
        let mut state = self.process.state();

        if !state.alive {
            return Err(SimError::Gone);
        }

        state.traps.remove(&addr.address().get());
        Ok(())
    }

    fn on_exit(&mut self, notifier: ExitNotifier) {
        let mut state = self.process.state();

        if state.alive {
            state.exit_notifier = Some(notifier);
        } else {
            drop(state);
            notifier(ExitReason::Exited(0));
        }
    }

    fn detach(&mut self) -> Result<(), Self::Error> {
        let mut state = self.process.state();

        state.attached = false;
        state.traps.clear();
        state.exit_notifier = None;

        if state.alive { Ok(()) } else { Err(SimError::Gone) }
    }
}

struct SimFrame<'a> {
    process: &'a SimProcess,
    thread_id: u64,
    args: &'a mut [u64],
}

impl CallFrame for SimFrame<'_> {
    fn thread_id(&self) -> u64 {
        self.thread_id
    }

    fn argument(&self, index: usize) -> Result<u64, FrameError> {
        self.args
            .get(index)
            .copied()
            .ok_or(FrameError::ArgumentUnavailable(index))
    }

    fn set_argument(&mut self, index: usize, value: u64) -> Result<(), FrameError> {
        let slot = self
            .args
            .get_mut(index)
            .ok_or(FrameError::ArgumentUnavailable(index))?;

        *slot = value;
        Ok(())
    }

    fn read_memory(&self, addr: Address, buf: &mut [u8]) -> Result<(), FrameError> {
        self.process
            .state()
            .read(addr.get(), buf)
            .map_err(|e| FrameError::Memory {
                address: addr,
                len: buf.len(),
                source: Some(Box::new(e)),
            })
    }

    fn write_memory(&mut self, addr: Address, buf: &[u8]) -> Result<(), FrameError> {
        self.process
            .state()
            .write(addr.get(), buf)
            .map_err(|e| FrameError::Memory {
                address: addr,
                len: buf.len(),
                source: Some(Box::new(e)),
            })
    }
}
