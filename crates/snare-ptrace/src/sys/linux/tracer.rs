use std::collections::HashSet;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use snare_engine::backend::{ExitNotifier, ExitReason};

use super::frame::PtraceFrame;
use super::trap::TrapTable;
use super::{Error, Result, procfs};

/// Delay between two polls of the tracees, when none of them has anything to
/// report.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

const EVENT_CLONE: i32 = ptrace::Event::PTRACE_EVENT_CLONE as i32;
const EVENT_EXEC: i32 = ptrace::Event::PTRACE_EVENT_EXEC as i32;
const EVENT_STOP: i32 = ptrace::Event::PTRACE_EVENT_STOP as i32;

/// Request sent to the tracer thread.
pub enum Request {
    /// Detach from every thread, then stop tracing.
    Detach(Sender<Result<()>>),
}

/// State shared between the tracer thread and the target handle.
pub struct Shared {
    traps: Mutex<TrapTable>,
    exit: Mutex<ExitState>,
}

enum ExitState {
    Running(Option<ExitNotifier>),
    Exited(ExitReason),
    Detached,
}

impl Shared {
    pub fn new(traps: TrapTable) -> Self {
        Self {
            traps: Mutex::new(traps),
            exit: Mutex::new(ExitState::Running(None)),
        }
    }

    pub fn traps(&self) -> MutexGuard<'_, TrapTable> {
        self.traps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self) -> MutexGuard<'_, ExitState> {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the function to call when the process exits.
    ///
    /// It is called right away if the process already exited.
    pub fn set_exit_notifier(&self, notifier: ExitNotifier) {
        let mut state = self.exit();

        let reason = match &mut *state {
            ExitState::Running(slot) => {
                *slot = Some(notifier);
                return;
            }
            ExitState::Exited(reason) => *reason,
            ExitState::Detached => return,
        };

        drop(state);
        notifier(reason);
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match *self.exit() {
            ExitState::Exited(reason) => Some(reason),
            _ => None,
        }
    }

    /// Drops the exit notifier, the process exit isn't reported past this
    /// point.
    pub fn detached(&self) {
        let mut state = self.exit();

        if matches!(*state, ExitState::Running(_)) {
            *state = ExitState::Detached;
        }
    }

    fn exited(&self, reason: ExitReason) {
        let notifier = {
            let mut state = self.exit();

            match std::mem::replace(&mut *state, ExitState::Exited(reason)) {
                ExitState::Running(notifier) => notifier,
                ExitState::Detached => {
                    *state = ExitState::Detached;
                    None
                }
                ExitState::Exited(_) => None,
            }
        };

        tracing::info!(%reason, "process exited");

        if let Some(notifier) = notifier {
            notifier(reason);
        }
    }
}

enum Flow {
    Continue,
    Exited(ExitReason),
}

/// Outcome of single-stepping a thread.
enum Step {
    Done(Option<Signal>),
    Gone(WaitStatus),
}

/// Owner of the ptrace attachment of every thread of a process.
///
/// All the ptrace requests must come from the same OS thread, so the tracer
/// runs on a dedicated one. Threads are seized (`PTRACE_SEIZE`), so that
/// job-control stops of the process keep their meaning: group-stops are
/// parked with `PTRACE_LISTEN` until `SIGCONT`.
pub struct Tracer {
    pid: Pid,
    threads: HashSet<Pid>,
    shared: Arc<Shared>,
}

impl Tracer {
    pub fn new(pid: u64, shared: Arc<Shared>) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            threads: HashSet::new(),
            shared,
        }
    }

    /// Attaches to the process, then handles its events until detached or
    /// exited.
    pub fn run(
        mut self,
        ready: tokio::sync::oneshot::Sender<Result<()>>,
        requests: Receiver<Request>,
    ) {
        let _span = tracing::info_span!("Tracer", pid = self.pid.as_raw()).entered();

        if let Err(e) = self.attach_all() {
            self.finish();
            let _ = ready.send(Err(e));
            return;
        }

        tracing::debug!(threads = self.threads.len(), "attached");

        if ready.send(Ok(())).is_err() {
            tracing::debug!("attach cancelled");
            self.finish();
            return;
        }

        loop {
            match requests.try_recv() {
                Ok(Request::Detach(reply)) => {
                    let _ = reply.send(self.detach_all());
                    return;
                }
                Err(TryRecvError::Disconnected) => {
                    self.finish();
                    return;
                }
                Err(TryRecvError::Empty) => (),
            }

            let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD | WaitPidFlag::WNOHANG;

            match waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => std::thread::sleep(POLL_INTERVAL),
                Ok(status) => match self.on_status(status) {
                    Ok(Flow::Continue) => (),
                    Ok(Flow::Exited(reason)) => {
                        self.shared.exited(reason);
                        return;
                    }
                    Err(Error::Os(Errno::ESRCH)) => {
                        tracing::trace!(?status, "thread vanished");
                    }
                    Err(e) => tracing::warn!(error = %e, ?status, "tracee event"),
                },
                Err(Errno::EINTR) => (),
                Err(Errno::ECHILD) => {
                    tracing::warn!("every tracee vanished");
                    self.shared.exited(ExitReason::Exited(0));
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "waitpid");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.detach_all() {
            tracing::warn!(error = %e, "detach");
        }
    }

    /// Attaches to every thread of the process.
    ///
    /// The thread list is read again until no new thread shows up. Threads
    /// spawned by an already seized thread are traced by the kernel through
    /// `PTRACE_O_TRACECLONE`.
    fn attach_all(&mut self) -> Result<()> {
        loop {
            let mut attached_new = false;

            for tid in procfs::threads(self.pid.as_raw() as u64)? {
                let tid = Pid::from_raw(tid as i32);

                if self.threads.contains(&tid) {
                    continue;
                }

                match attach_thread(tid) {
                    Ok(()) => {
                        self.threads.insert(tid);
                        attached_new = true;
                    }
                    Err(Error::Os(Errno::ESRCH)) if tid != self.pid => {
                        tracing::trace!(tid = tid.as_raw(), "thread exited before attach");
                    }
                    Err(Error::Os(Errno::ESRCH)) => {
                        return Err(Error::NoSuchProcess(self.pid.as_raw() as u64));
                    }
                    Err(e) => return Err(e),
                }
            }

            if !attached_new {
                return Ok(());
            }
        }
    }

    fn on_status(&mut self, status: WaitStatus) -> Result<Flow> {
        match status {
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                self.threads.insert(tid);
                return self.on_trap(tid);
            }

            // signal-delivery-stop, a stopping signal leads to a group-stop
            WaitStatus::Stopped(tid, signal) => {
                self.threads.insert(tid);
                ptrace::cont(tid, signal)?;
            }

            WaitStatus::PtraceEvent(tid, signal, event) => {
                self.threads.insert(tid);
                return self.on_event(tid, signal, event);
            }

            WaitStatus::Exited(tid, code) => {
                self.threads.remove(&tid);

                if tid == self.pid {
                    return Ok(Flow::Exited(ExitReason::Exited(code)));
                }
            }

            WaitStatus::Signaled(tid, signal, _) => {
                self.threads.remove(&tid);

                if tid == self.pid {
                    return Ok(Flow::Exited(ExitReason::Signaled(signal as i32)));
                }
            }

            _ => (),
        }

        Ok(Flow::Continue)
    }

    fn on_event(&mut self, tid: Pid, signal: Signal, event: i32) -> Result<Flow> {
        match event {
            EVENT_CLONE => {
                let new_tid = Pid::from_raw(ptrace::getevent(tid)? as i32);
                self.threads.insert(new_tid);

                tracing::debug!(tid = new_tid.as_raw(), "new thread");

                ptrace::cont(tid, None)?;
            }

            EVENT_EXEC => {
                // the traps went away with the old image
                self.shared.traps().forget_all();
                self.threads.clear();

                if let Err(e) = ptrace::detach(tid, None) {
                    tracing::debug!(tid = tid.as_raw(), error = %e, "ptrace(PTRACE_DETACH)");
                }

                return Ok(Flow::Exited(ExitReason::Replaced));
            }

            EVENT_STOP if is_stopping(signal) => {
                tracing::trace!(tid = tid.as_raw(), %signal, "group-stop");
                listen(tid)?;
            }

            // initial stop of a new thread, or end of a group-stop
            _ => ptrace::cont(tid, None)?,
        }

        Ok(Flow::Continue)
    }

    fn on_trap(&mut self, tid: Pid) -> Result<Flow> {
        let mut regs = ptrace::getregs(tid)?;
        let addr = regs.rip.wrapping_sub(1);

        let (interceptor, retired) = {
            let traps = self.shared.traps();
            (traps.interceptor(addr), traps.is_retired(addr))
        };

        let Some(interceptor) = interceptor else {
            if retired {
                // removed while the thread was reporting it
                regs.rip = addr;
                ptrace::setregs(tid, regs)?;
                ptrace::cont(tid, None)?;
            } else {
                ptrace::cont(tid, Signal::SIGTRAP)?;
            }

            return Ok(Flow::Continue);
        };

        regs.rip = addr;

        let mut frame = PtraceFrame::new(self.pid.as_raw() as u64, tid, &mut regs);
        interceptor.on_enter(&mut frame);

        if frame.is_dirty() {
            tracing::trace!(tid = tid.as_raw(), "registers modified");
        }

        ptrace::setregs(tid, regs)?;

        match self.step_over(tid, addr)? {
            Step::Done(signal) => {
                ptrace::cont(tid, signal)?;
                Ok(Flow::Continue)
            }
            Step::Gone(status) => self.on_status(status),
        }
    }

    /// Executes the original instruction at `addr`, then puts the trap back.
    fn step_over(&mut self, tid: Pid, addr: u64) -> Result<Step> {
        self.shared.traps().disable(addr)?;

        let stepped = single_step(tid);

        self.shared.traps().enable(addr)?;

        stepped
    }

    /// Detaches from every thread.
    ///
    /// Each thread is interrupted first, so that traps it already hit (but
    /// didn't report) get rewound. Threads in a group-stop stay stopped.
    fn detach_all(&mut self) -> Result<()> {
        let mut pending: Vec<Pid> = self.threads.drain().collect();
        let mut first_err = None;

        while let Some(tid) = pending.pop() {
            if let Err(e) = self.detach_thread(tid, &mut pending) {
                tracing::debug!(tid = tid.as_raw(), error = %e, "detach thread");
                first_err.get_or_insert(e);
            }
        }

        tracing::debug!("detached");

        first_err.map_or(Ok(()), Err)
    }

    fn detach_thread(&self, tid: Pid, pending: &mut Vec<Pid>) -> Result<()> {
        match ptrace::interrupt(tid) {
            Err(Errno::ESRCH) => return Ok(()),
            res => res?,
        }

        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::PtraceEvent(_, _, EVENT_STOP) => break,

                WaitStatus::PtraceEvent(_, _, EVENT_CLONE) => {
                    pending.push(Pid::from_raw(ptrace::getevent(tid)? as i32));
                    ptrace::cont(tid, None)?;
                }

                WaitStatus::PtraceEvent(..) => ptrace::cont(tid, None)?,

                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let mut regs = ptrace::getregs(tid)?;
                    let addr = regs.rip.wrapping_sub(1);

                    if self.shared.traps().is_retired(addr) {
                        regs.rip = addr;
                        ptrace::setregs(tid, regs)?;
                        ptrace::cont(tid, None)?;
                    } else {
                        ptrace::cont(tid, Signal::SIGTRAP)?;
                    }
                }

                WaitStatus::Stopped(_, signal) => ptrace::cont(tid, signal)?,

                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Ok(()),

                _ => (),
            }
        }

        ptrace::detach(tid, None)?;

        Ok(())
    }
}

fn attach_thread(tid: Pid) -> Result<()> {
    let options = ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_TRACEEXEC;

    ptrace::seize(tid, options)
        .inspect_err(|e| tracing::debug!(tid = tid.as_raw(), error = %e, "ptrace(PTRACE_SEIZE)"))?;

    Ok(())
}

fn single_step(tid: Pid) -> Result<Step> {
    let mut forwarded = None;

    ptrace::step(tid, None)?;

    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(Step::Done(forwarded)),

            WaitStatus::Stopped(_, signal) => {
                forwarded = Some(signal);
                ptrace::step(tid, None)?;
            }

            // the thread joins the group-stop once the instruction is executed
            WaitStatus::PtraceEvent(_, signal, EVENT_STOP) if is_stopping(signal) => {
                forwarded.get_or_insert(signal);
                ptrace::step(tid, None)?;
            }

            status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                return Ok(Step::Gone(status));
            }

            _ => ptrace::step(tid, None)?,
        }
    }
}

/// Returns whether `signal` stops the process (job control).
fn is_stopping(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}

/// Leaves a thread in its group-stop, while letting `SIGCONT` resume it.
fn listen(tid: Pid) -> Result<()> {
    unsafe {
        Errno::result(nix::libc::ptrace(
            nix::libc::PTRACE_LISTEN,
            tid.as_raw(),
            std::ptr::null_mut::<nix::libc::c_void>(),
            std::ptr::null_mut::<nix::libc::c_void>(),
        ))
    }?;

    Ok(())
}
