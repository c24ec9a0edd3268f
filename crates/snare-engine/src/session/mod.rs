mod instrumenter;
mod state;

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use indexmap::IndexMap;

pub use self::instrumenter::Instrumenter;
use self::instrumenter::Claim;
pub use self::state::SessionState;
use crate::address::{Address, ResolvedAddress};
use crate::backend::{ExitReason, Fault, FaultKind, Target};
use crate::channel::{self, ChannelEvent, CloseReason, Closer, Command, Endpoint, LogLevel, Message};
use crate::error::{Error, Implausibility, InstallError};
use crate::hook::{Gate, HookDescriptor, HookDispatch, InstallHandle, Invocation};
use crate::module::{ModuleInfo, RetryPolicy};
use crate::process::ProcessHandle;

/// Controller side of the control channel.
pub type ControllerEndpoint = Endpoint<Message, Command>;

/// Instrumentation side of the control channel.
pub type PayloadEndpoint = Endpoint<Command, Message>;

/// Instrumentation session over an attached process.
///
/// The session is detached when dropped.
pub struct Session<T: Target> {
    /// Session ID, unique within its [Instrumenter].
    id: u64,

    /// Attached process.
    process: ProcessHandle,

    /// Lifecycle state (see [Session::state]).
    state: SessionState,

    /// Backend handle over the attached process.
    target: T,

    /// Target module, once verified.
    module: Option<ModuleInfo>,

    /// Installed hooks, by absolute address.
    hooks: IndexMap<Address, InstalledHook>,

    /// Interception gate shared by all hooks.
    gate: Arc<Gate>,

    /// Instrumentation side of the control channel, once loaded.
    payload: Option<PayloadEndpoint>,

    /// Exit notification of the attached process.
    exit: Arc<ExitWatch>,

    /// Attachment registry entry, freed on detach.
    claim: Option<Claim>,
}

struct InstalledHook {
    descriptor: Arc<HookDescriptor>,
    address: ResolvedAddress,
}

/// Exit status of the attached process, shared with the backend's exit
/// notifier.
#[derive(Default)]
struct ExitWatch {
    reason: OnceLock<ExitReason>,
    closer: Mutex<Option<Closer>>,
}

impl ExitWatch {
    fn notify(&self, pid: u64, reason: ExitReason, gate: &Gate) {
        if self.reason.set(reason).is_err() {
            return;
        }

        tracing::info!(pid, %reason, "attached process is gone");

        gate.close();

        let closer = self
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(closer) = closer {
            closer.close(CloseReason::TargetExited(reason));
        }
    }

    /// Wires the control channel to the exit notification.
    ///
    /// Returns `false` if the process already exited.
    fn watch(&self, closer: Closer) -> bool {
        let mut slot = self.closer.lock().unwrap_or_else(PoisonError::into_inner);

        if self.reason.get().is_some() {
            return false;
        }

        *slot = Some(closer);
        true
    }
}

impl<T: Target> Session<T> {
    pub(crate) fn new(id: u64, process: ProcessHandle, mut target: T, claim: Claim) -> Self {
        let gate = Arc::new(Gate::new());
        let exit = Arc::new(ExitWatch::default());

        target.on_exit(Box::new({
            let pid = process.pid();
            let gate = gate.clone();
            let exit = exit.clone();
            move |reason| exit.notify(pid, reason, &gate)
        }));

        Self {
            id,
            process,
            state: SessionState::Attached,
            target,
            module: None,
            hooks: IndexMap::new(),
            gate,
            payload: None,
            exit,
            claim: Some(claim),
        }
    }

    /// Returns the session ID.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the attached process.
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Returns the current state of the session.
    ///
    /// A session whose process exited is [Detached](SessionState::Detached).
    pub fn state(&self) -> SessionState {
        if self.exit.reason.get().is_some() {
            SessionState::Detached
        } else {
            self.state
        }
    }

    /// Returns the verified target module.
    pub fn module(&self) -> Option<&ModuleInfo> {
        self.module.as_ref()
    }

    /// Returns why the attached process stopped, if it did.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit.reason.get().copied()
    }

    /// Returns the backend handle over the attached process.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Finds a loaded module by exact (case-sensitive) file name.
    pub async fn resolve_module(&self, name: &str) -> crate::Result<ModuleInfo> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::InvalidState {
                operation: "resolve module",
                state,
            });
        }

        let modules = self
            .target
            .modules()
            .await
            .map_err(|e| Error::from_fault(self.process.pid(), e))?;

        modules
            .into_iter()
            .find(|module| module.name() == name)
            .ok_or_else(|| Error::ModuleNotFound(name.to_owned()))
    }

    /// Checks whether the target module is loaded, once.
    ///
    /// On success, the module is kept by the session which becomes
    /// [Verified](SessionState::Verified). Otherwise the session stays
    /// [Attached](SessionState::Attached), so that the caller may poll again.
    pub async fn verify_module_present(&mut self, name: &str) -> crate::Result<bool> {
        self.expect_state("verify module", SessionState::Attached)?;
        self.transition(SessionState::Verifying);

        match self.resolve_module(name).await {
            Ok(module) => {
                tracing::debug!(
                    module = name,
                    base = format_args!("{:#x}", module.base()),
                    size = module.size(),
                    "module found"
                );

                self.module = Some(module);
                self.transition(SessionState::Verified);
                Ok(true)
            }
            Err(Error::ModuleNotFound(_)) => {
                self.transition(SessionState::Attached);
                Ok(false)
            }
            Err(e) => {
                self.transition(SessionState::Attached);
                Err(e)
            }
        }
    }

    /// Polls until the target module is loaded.
    ///
    /// Polling is bounded by the policy: once exhausted, the session becomes
    /// [VerifyFailed](SessionState::VerifyFailed) and
    /// [ModuleNotFound](Error::ModuleNotFound) is returned.
    #[tracing::instrument(name = "AwaitModule", skip(self, policy), fields(pid = self.process.pid()))]
    pub async fn await_module(
        &mut self,
        name: &str,
        policy: &RetryPolicy,
    ) -> crate::Result<ModuleInfo> {
        self.expect_state("await module", SessionState::Attached)?;

        let polling = async {
            for attempt in 0..policy.max_attempts {
                if self.verify_module_present(name).await? {
                    return Ok(true);
                }

                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }

            Ok::<_, Error>(false)
        };

        let outcome = match tokio::time::timeout(policy.timeout, polling).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::debug!(timeout = ?policy.timeout, "polling timed out");
                Ok(false)
            }
        };

        match (outcome, self.module.clone()) {
            (Ok(true), Some(module)) => Ok(module),
            (Ok(_), _) => {
                tracing::warn!("module never showed up");
                self.transition(SessionState::VerifyFailed);
                Err(Error::ModuleNotFound(name.to_owned()))
            }
            (Err(e), _) => {
                self.transition(SessionState::VerifyFailed);
                Err(e)
            }
        }
    }

    /// Opens the control channel, and makes the session
    /// [Active](SessionState::Active).
    ///
    /// The returned endpoint receives a [Message::Ready] first, and a single
    /// [ChannelEvent::Closed] event when the session is detached or the
    /// process exits.
    #[tracing::instrument(name = "LoadPayload", skip_all, fields(pid = self.process.pid()))]
    pub fn load_payload(&mut self) -> crate::Result<ControllerEndpoint> {
        self.expect_state("load payload", SessionState::Verified)?;

        let Some(module) = self.module.clone() else {
            return Err(Error::InvalidState {
                operation: "load payload",
                state: SessionState::Attached,
            });
        };

        self.transition(SessionState::PayloadLoading);

        let (controller, payload) = channel::channel::<Message, Command>();

        if !self.exit.watch(payload.closer()) {
            return Err(Error::ProcessExited(self.process.pid()));
        }

        payload.send(Message::Ready {
            module: module.name().to_owned(),
            base: module.base().get(),
        })?;

        self.payload = Some(payload);
        self.transition(SessionState::Active);

        Ok(controller)
    }

    /// Installs an entry hook.
    ///
    /// The absolute address is derived from the (re-resolved) module base
    /// and the descriptor's offset. The bytes found there must match one of
    /// the descriptor's prologue patterns, otherwise nothing is installed.
    ///
    /// `on_enter` runs on the intercepted thread, possibly concurrently with
    /// itself, and never after the session is detached.
    #[tracing::instrument(
        name = "Install",
        skip_all,
        fields(pid = self.process.pid(), hook = %descriptor.label())
    )]
    pub async fn install<F>(
        &mut self,
        descriptor: HookDescriptor,
        on_enter: F,
    ) -> crate::Result<InstallHandle>
    where
        F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
    {
        self.expect_state("install hook", SessionState::Active)?;

        let module = match self.refresh_module().await {
            Ok(module) => module,
            Err(Error::ProcessExited(_)) => {
                let address = self
                    .module
                    .as_ref()
                    .and_then(|module| module.resolve(descriptor.offset()))
                    .map_or(Address::NULL, ResolvedAddress::address);

                return Err(InstallError::TargetUnreachable { address }.into());
            }
            Err(e) => return Err(e),
        };

        let Some(address) = module.resolve(descriptor.offset()) else {
            return Err(InstallError::ImplausibleTarget {
                address: module.base(),
                reason: Implausibility::OutOfModule {
                    offset: descriptor.offset(),
                    module_size: module.size(),
                },
            }
            .into());
        };

        if self.hooks.contains_key(&address.address()) {
            return Err(InstallError::AlreadyInstalled {
                address: address.address(),
            }
            .into());
        }

        self.check_prologue(&descriptor, address)?;

        let descriptor = Arc::new(descriptor);
        let hits = Arc::new(AtomicU64::new(0));

        let dispatch = HookDispatch {
            descriptor: descriptor.clone(),
            address,
            hits: hits.clone(),
            gate: self.gate.clone(),
            on_enter: Arc::new(on_enter),
            notifier: self.payload.as_ref().map(Endpoint::sender),
        };

        self.target
            .intercept(address, Arc::new(dispatch))
            .map_err(|e| match e.kind() {
                FaultKind::ProcessExited => InstallError::TargetUnreachable {
                    address: address.address(),
                }
                .into(),
                _ => Error::Backend(Box::new(e)),
            })?;

        tracing::info!(address = format_args!("{:#x}", address.address()), "hook installed");

        self.notify(Message::Hooked {
            name: descriptor.label(),
            address: address.address().get(),
        });

        self.hooks.insert(
            address.address(),
            InstalledHook {
                descriptor,
                address,
            },
        );

        Ok(InstallHandle::new(self.id, address, hits))
    }

    /// Removes a hook.
    ///
    /// If the process is gone (or the session detached), the hook is
    /// considered already removed.
    #[tracing::instrument(name = "Uninstall", skip_all, fields(pid = self.process.pid(), address = %handle.address()))]
    pub fn uninstall(&mut self, handle: &InstallHandle) -> crate::Result<()> {
        let state = self.state();

        if state == SessionState::Detached {
            return Ok(());
        }

        if state != SessionState::Active {
            return Err(Error::InvalidState {
                operation: "uninstall hook",
                state,
            });
        }

        let address = handle.address().address();

        if handle.session_id() != self.id {
            return Err(Error::HookNotFound(address));
        }

        let hook = self
            .hooks
            .shift_remove(&address)
            .ok_or(Error::HookNotFound(address))?;

        match self.target.release(hook.address) {
            Ok(()) => (),
            Err(e) if e.kind() == FaultKind::ProcessExited => {
                tracing::debug!("process gone, hook already removed");
                return Ok(());
            }
            Err(e) => return Err(Error::from_fault(self.process.pid(), e)),
        }

        tracing::info!("hook removed");

        self.notify(Message::Unhooked {
            address: address.get(),
        });

        Ok(())
    }

    /// Returns the number of interceptions of an installed hook.
    ///
    /// Returns `None` if the hook is not installed in this session.
    pub fn hits(&self, handle: &InstallHandle) -> Option<u64> {
        (handle.session_id() == self.id && self.hooks.contains_key(&handle.address().address()))
            .then(|| handle.hits())
    }

    /// Returns the descriptors of the installed hooks, in installation
    /// order.
    pub fn hooks(&self) -> impl Iterator<Item = (ResolvedAddress, &HookDescriptor)> {
        self.hooks
            .values()
            .map(|hook| (hook.address, hook.descriptor.as_ref()))
    }

    /// Drains the pending controller commands.
    ///
    /// [Command::Ping] is answered right away and not returned.
    pub fn poll_commands(&mut self) -> Vec<Command> {
        let Some(payload) = &mut self.payload else {
            return Vec::new();
        };

        let mut commands = Vec::new();

        while let Some(event) = payload.try_recv() {
            match event {
                ChannelEvent::Message(Command::Ping) => {
                    let _ = payload.send(Message::log(LogLevel::Debug, "pong"));
                }
                ChannelEvent::Message(command) => commands.push(command),
                ChannelEvent::Closed(_) => break,
            }
        }

        commands
    }

    /// Sends a message to the controller, if the channel is open.
    pub fn notify(&self, message: Message) {
        if let Some(payload) = &self.payload {
            let _ = payload.send(message);
        }
    }

    /// Detaches from the process.
    ///
    /// The interception gate is closed first (waiting for in-flight
    /// callbacks), then hooks are released, the backend detaches, and the
    /// control channel is closed. Detaching twice is a no-op.
    #[tracing::instrument(name = "Detach", skip_all, fields(pid = self.process.pid()))]
    pub fn detach(&mut self) -> crate::Result<()> {
        if self.state == SessionState::Detached {
            return Ok(());
        }

        self.gate.close();

        let pid = self.process.pid();
        let exited = self.exit.reason.get().is_some();

        for (address, hook) in self.hooks.drain(..) {
            if exited {
                continue;
            }

            match self.target.release(hook.address) {
                Ok(()) => {
                    if let Some(payload) = &self.payload {
                        let _ = payload.send(Message::Unhooked {
                            address: address.get(),
                        });
                    }
                }
                Err(e) if e.kind() == FaultKind::ProcessExited => (),
                Err(e) => tracing::warn!(
                    address = format_args!("{address:#x}"),
                    "failed to release hook: {e}"
                ),
            }
        }

        let result = match self.target.detach() {
            Err(e) if e.kind() != FaultKind::ProcessExited => Err(Error::from_fault(pid, e)),
            _ => Ok(()),
        };

        if let Some(payload) = self.payload.take() {
            payload.close(CloseReason::Detached);
        }

        self.claim.take();
        self.transition(SessionState::Detached);

        tracing::info!("detached");

        result
    }

    async fn refresh_module(&mut self) -> crate::Result<ModuleInfo> {
        let Some(cached) = self.module.clone() else {
            return Err(Error::InvalidState {
                operation: "install hook",
                state: self.state(),
            });
        };

        let current = self.resolve_module(cached.name()).await?;

        if current.base() != cached.base() {
            tracing::warn!(
                module = current.name(),
                old = format_args!("{:#x}", cached.base()),
                new = format_args!("{:#x}", current.base()),
                "module base changed"
            );

            self.notify(Message::log(
                LogLevel::Warn,
                format!(
                    "module {} reloaded at {} (was {})",
                    current.name(),
                    current.base(),
                    cached.base()
                ),
            ));

            self.module = Some(current.clone());
        }

        Ok(current)
    }

    fn check_prologue(
        &self,
        descriptor: &HookDescriptor,
        address: ResolvedAddress,
    ) -> Result<(), InstallError> {
        if descriptor.prologues().is_empty() {
            return Err(InstallError::ImplausibleTarget {
                address: address.address(),
                reason: Implausibility::NoPrologues,
            });
        }

        let mut prefix = vec![0; descriptor.prologue_len()];

        if let Err(e) = self.target.read_memory(address.address(), &mut prefix) {
            return Err(match e.kind() {
                FaultKind::ProcessExited => InstallError::TargetUnreachable {
                    address: address.address(),
                },
                _ => {
                    tracing::debug!("cannot read prologue: {e}");

                    InstallError::ImplausibleTarget {
                        address: address.address(),
                        reason: Implausibility::Unreadable,
                    }
                }
            });
        }

        if descriptor
            .prologues()
            .iter()
            .any(|pattern| pattern.matches_prefix(&prefix))
        {
            Ok(())
        } else {
            Err(InstallError::ImplausibleTarget {
                address: address.address(),
                reason: Implausibility::PrologueMismatch { found: prefix },
            })
        }
    }

    fn expect_state(&self, operation: &'static str, expected: SessionState) -> crate::Result<()> {
        let state = self.state();

        if state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { operation, state })
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = %self.state, to = %next, "session state changed");
        self.state = next;
    }
}

impl<T: Target> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            tracing::warn!(pid = self.process.pid(), "failed to detach: {e}");
        }
    }
}

impl<T: Target> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("process", &self.process)
            .field("state", &self.state())
            .field("module", &self.module)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
