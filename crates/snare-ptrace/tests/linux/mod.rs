use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use snare_engine::backend::{ExitReason, Target};
use snare_engine::channel::{ChannelEvent, CloseReason, Message};
use snare_engine::{
    Address, AttachError, HookDescriptor, Instrumenter, Interpretation, Invocation, Offset,
    ProcessFilter, ProcessHandle, RetryPolicy, Session, SessionState,
};
use snare_ptrace::{Ptrace, PtraceTarget};
use test_log::test;

struct Sleeper(Child);

impl Sleeper {
    fn spawn(duration: &str) -> Self {
        Self(Command::new("sleep").arg(duration).spawn().expect("sleep"))
    }

    fn pid(&self) -> u64 {
        self.0.id().into()
    }

    fn is_running(&mut self) -> bool {
        self.0.try_wait().unwrap().is_none()
    }

    /// File name of the process executable (e.g., `sleep` or `busybox`).
    fn executable(&self) -> String {
        std::fs::read_link(format!("/proc/{}/exe", self.pid()))
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Returns the state letter of `/proc/<pid>/stat` (e.g., `S`, `T`, `t`).
fn process_state(pid: u64) -> char {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
    stat.rsplit(')').next().unwrap().trim_start().chars().next().unwrap()
}

async fn wait_for_state(pid: u64, accepted: &[char]) -> char {
    let mut state = process_state(pid);

    for _ in 0..200 {
        if accepted.contains(&state) {
            return state;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        state = process_state(pid);
    }

    panic!("process {pid} in state {state}, expected one of {accepted:?}");
}

fn send_signal(pid: u64, signal: Signal) {
    kill(Pid::from_raw(pid as i32), signal).unwrap();
}

async fn find(instrumenter: &Instrumenter<Ptrace>, pid: u64) -> ProcessHandle {
    instrumenter
        .find_candidates(ProcessFilter::predicate(move |p| p.pid() == pid))
        .await
        .unwrap()
        .next()
        .expect("process not found")
}

/// Attaches to the process, or returns `None` if ptrace is not allowed on
/// this host.
async fn try_attach(
    instrumenter: &Instrumenter<Ptrace>,
    process: &ProcessHandle,
) -> Option<Session<PtraceTarget>> {
    match instrumenter.attach(process).await {
        Ok(session) => Some(session),
        Err(AttachError::PermissionDenied { .. }) => {
            tracing::warn!("ptrace not permitted, skipping");
            None
        }
        Err(e) => panic!("attach failed: {e}"),
    }
}

#[test(tokio::test)]
async fn running_process_is_found() {
    let sleeper = Sleeper::spawn("30");
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, sleeper.pid()).await;
    assert_eq!(process.name(), sleeper.executable());

    let by_name: Vec<_> = instrumenter
        .find_candidates(sleeper.executable().to_uppercase())
        .await
        .unwrap()
        .map(|p| p.pid())
        .collect();

    assert!(by_name.contains(&sleeper.pid()));
    assert!(by_name.is_sorted());
}

#[test(tokio::test)]
async fn attach_inspect_and_detach() {
    let mut sleeper = Sleeper::spawn("30");
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, sleeper.pid()).await;

    let Some(mut session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    let err = instrumenter.attach(&process).await.unwrap_err();
    assert!(matches!(err, AttachError::AlreadyAttached { .. }));

    let executable = sleeper.executable();

    let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_secs(2));
    session.await_module(&executable, &policy).await.unwrap();

    assert_eq!(session.state(), SessionState::Verified);

    let base = session.module().unwrap().base();

    let mut magic = [0u8; 4];
    session.target().read_memory(base, &mut magic).unwrap();
    assert_eq!(&magic, b"\x7fELF");

    session.detach().unwrap();
    assert_eq!(session.state(), SessionState::Detached);

    // still alive, and not stopped
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sleeper.is_running());

    assert_eq!(process_state(sleeper.pid()), 'S');

    // attachable again
    drop(try_attach(&instrumenter, &process).await);
}

#[test(tokio::test)]
async fn unknown_pid_is_reported_as_exited() {
    let instrumenter = Instrumenter::new(Ptrace);

    let process = ProcessHandle::new(u64::from(i32::MAX as u32), "ghost");

    let err = instrumenter.attach(&process).await.unwrap_err();
    assert!(matches!(err, AttachError::ProcessExited { .. }));
}

#[test(tokio::test)]
async fn exit_closes_the_channel() {
    let sleeper = Sleeper::spawn("0.5");
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, sleeper.pid()).await;

    let Some(mut session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_secs(2));
    session
        .await_module(&sleeper.executable(), &policy)
        .await
        .unwrap();

    let mut controller = session.load_payload().unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match controller.recv().await {
                Some(ChannelEvent::Closed(reason)) => break reason,
                Some(ChannelEvent::Message(_)) => continue,
                None => panic!("channel dropped without close event"),
            }
        }
    })
    .await
    .expect("process exit not reported");

    assert_eq!(closed, CloseReason::TargetExited(ExitReason::Exited(0)));
    assert_eq!(session.state(), SessionState::Detached);

    // nothing to detach from anymore
    session.detach().unwrap();
}

#[test(tokio::test)]
async fn unmapped_memory_read_fails() {
    let sleeper = Sleeper::spawn("30");
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, sleeper.pid()).await;

    let Some(session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    assert!(
        session
            .target()
            .read_memory(Address::new(0x10), &mut [0u8; 8])
            .is_err()
    );
}

#[test(tokio::test)]
async fn job_control_stops_the_attached_process() {
    let sleeper = Sleeper::spawn("30");
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, sleeper.pid()).await;

    let Some(mut session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    // stopped, either as seen by the tracer (`t`) or not
    send_signal(sleeper.pid(), Signal::SIGSTOP);
    wait_for_state(sleeper.pid(), &['T', 't']).await;

    send_signal(sleeper.pid(), Signal::SIGCONT);
    wait_for_state(sleeper.pid(), &['S', 'R']).await;

    // a stop is kept across detach
    send_signal(sleeper.pid(), Signal::SIGSTOP);
    wait_for_state(sleeper.pid(), &['T', 't']).await;

    session.detach().unwrap();
    wait_for_state(sleeper.pid(), &['T']).await;

    send_signal(sleeper.pid(), Signal::SIGCONT);
    wait_for_state(sleeper.pid(), &['S', 'R']).await;
}

#[test(tokio::test)]
async fn exec_closes_the_session_and_leaves_the_process_running() {
    let mut shell = Sleeper(
        Command::new("sh")
            .args(["-c", "sleep 0.5; exec sleep 30"])
            .spawn()
            .expect("sh"),
    );
    let instrumenter = Instrumenter::new(Ptrace);

    let process = find(&instrumenter, shell.pid()).await;

    let Some(mut session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_secs(2));
    session
        .await_module(&shell.executable(), &policy)
        .await
        .unwrap();

    let mut controller = session.load_payload().unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match controller.recv().await {
                Some(ChannelEvent::Closed(reason)) => break reason,
                Some(ChannelEvent::Message(_)) => continue,
                None => panic!("channel dropped without close event"),
            }
        }
    })
    .await
    .expect("exec not reported");

    assert_eq!(closed, CloseReason::TargetExited(ExitReason::Replaced));
    assert_eq!(session.state(), SessionState::Detached);

    // the new image runs untraced
    assert!(shell.is_running());
    wait_for_state(shell.pid(), &['S', 'R']).await;

    let status = std::fs::read_to_string(format!("/proc/{}/status", shell.pid())).unwrap();
    assert!(status.lines().any(|line| line == "TracerPid:\t0"));
}

/// Set in the environment of the test binary spawned by
/// [hooked_function_sees_modified_arguments].
const CALL_LOOP_ENV: &str = "SNARE_CALL_LOOP";

#[inline(never)]
extern "C" fn add_score(total: u64, delta: u64) -> u64 {
    total.wrapping_add(delta)
}

/// Calls [add_score] in a loop, printing every total.
///
/// Only does something when run by [CallLoop::spawn].
#[test]
fn target_call_loop() {
    if std::env::var_os(CALL_LOOP_ENV).is_none() {
        return;
    }

    let mut stdout = std::io::stdout().lock();
    let mut total = 0u64;

    loop {
        total = add_score(std::hint::black_box(total), std::hint::black_box(1));

        if writeln!(stdout, "{total}").and_then(|()| stdout.flush()).is_err() {
            return;
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}

/// This test binary, running [target_call_loop].
struct CallLoop {
    child: Child,
    last_total: Arc<AtomicU64>,
}

impl CallLoop {
    fn spawn() -> Self {
        let mut child = Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "linux::target_call_loop", "--nocapture"])
            .env(CALL_LOOP_ENV, "1")
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn call loop");

        let last_total = Arc::new(AtomicU64::new(0));

        let stdout = child.stdout.take().unwrap();

        std::thread::spawn({
            let last_total = last_total.clone();
            move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };

                    if let Ok(total) = line.trim().parse::<u64>() {
                        last_total.store(total, Ordering::Relaxed);
                    }
                }
            }
        });

        Self { child, last_total }
    }

    fn pid(&self) -> u64 {
        self.child.id().into()
    }

    fn last_total(&self) -> u64 {
        self.last_total.load(Ordering::Relaxed)
    }

    async fn wait_for_calls(&self) {
        for _ in 0..500 {
            if self.last_total() > 0 {
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("call loop didn't start");
    }
}

impl Drop for CallLoop {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Returns the offset of [add_score] within this executable, and its first
/// bytes as a prologue pattern.
fn add_score_location() -> (Offset, String) {
    let exe = std::env::current_exe().unwrap();

    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();

    let base = maps
        .lines()
        .filter(|line| {
            line.split_whitespace()
                .nth(5)
                .is_some_and(|path| PathBuf::from(path) == exe)
        })
        .map(|line| {
            let (start, _) = line.split_once('-').unwrap();
            u64::from_str_radix(start, 16).unwrap()
        })
        .min()
        .expect("executable not mapped");

    let function = add_score as extern "C" fn(u64, u64) -> u64 as usize;

    // SAFETY: the function code is mapped and readable
    let code = unsafe { std::slice::from_raw_parts(function as *const u8, 4) };

    let pattern = code
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");

    (Offset::new(function as u64 - base), pattern)
}

#[test(tokio::test)]
async fn hooked_function_sees_modified_arguments() {
    let target = CallLoop::spawn();
    target.wait_for_calls().await;

    let instrumenter = Instrumenter::new(Ptrace);
    let process = find(&instrumenter, target.pid()).await;

    let Some(mut session) = try_attach(&instrumenter, &process).await else {
        return;
    };

    let executable = std::env::current_exe()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_secs(2));
    session.await_module(&executable, &policy).await.unwrap();

    let mut controller = session.load_payload().unwrap();

    let (offset, prologue) = add_score_location();

    let descriptor = HookDescriptor::new(offset)
        .named("add_score")
        .argument(0, Interpretation::U64)
        .argument(1, Interpretation::U64)
        .prologue(prologue.parse().unwrap());

    let handle = session
        .install(descriptor, |invocation: &mut Invocation<'_>| {
            let _ = invocation.report();
            invocation.set_argument(1, 1000).unwrap();
        })
        .await
        .unwrap();

    // two consecutive calls, the first one returning the modified sum
    let mut totals = Vec::new();

    tokio::time::timeout(Duration::from_secs(5), async {
        while totals.len() < 2 {
            match controller.recv().await {
                Some(ChannelEvent::Message(Message::Event {
                    hook, arguments, ..
                })) => {
                    assert_eq!(hook, "add_score");
                    assert_eq!(arguments[1], 1);
                    totals.push(arguments[0]);
                }
                Some(ChannelEvent::Message(_)) => continue,
                event => panic!("unexpected event: {event:?}"),
            }
        }
    })
    .await
    .expect("no call intercepted");

    assert_eq!(totals[1] - totals[0], 1000);
    assert!(handle.hits() >= 2);

    session.detach().unwrap();

    let hits = handle.hits();

    // the target keeps running its original code
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = target.last_total();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = target.last_total();

    assert!(after > before, "{before} -> {after}");
    assert!(after - before < 1000, "{before} -> {after}");
    assert_eq!(handle.hits(), hits);
}
