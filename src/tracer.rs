//! Call event source using ptrace
//!
//! Instrumented binaries report every library call by issuing a marker
//! syscall whose first argument is the call id. The tracer stops every
//! thread of the target at each syscall entry, picks out the marker, and
//! forwards [`CallEvent`]s tagged with the process id to the session over a
//! bounded channel.

use crate::config::{CallId, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MARKER_SYSCALL};
use crate::monitor::CallEvent;
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How the monitored process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    Signaled(i32),
}

impl ProcessExit {
    /// Shell-style status: the exit code, or 128 + signal number
    pub fn code(&self) -> i32 {
        match self {
            ProcessExit::Exited(code) => *code,
            ProcessExit::Signaled(sig) => 128 + sig,
        }
    }
}

/// Producer side of the enforcement loop
///
/// Implementations must report [`ProcessExit`] only after every event the
/// process produced before exiting is available from `poll_event`.
pub trait EventSource {
    /// Pid of the monitored process
    fn pid(&self) -> u32;

    /// Next event, waiting at most `timeout`
    fn poll_event(&mut self, timeout: Duration) -> Option<CallEvent>;

    /// Exit status once the process is gone
    fn try_wait(&mut self) -> Result<Option<ProcessExit>>;

    /// Forcibly terminate the process
    fn kill(&mut self) -> Result<()>;

    /// Stop observing the process and leave it running
    ///
    /// Returns once the process no longer depends on the caller staying
    /// alive.
    fn detach(&mut self) -> Result<()>;

    /// Events lost because the queue was full
    fn dropped_events(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerConfig {
    /// Syscall number instrumented binaries use to report a call id
    pub marker_syscall: i64,
    /// Event queue depth
    pub channel_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            marker_syscall: DEFAULT_MARKER_SYSCALL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Runs the target under ptrace on a dedicated tracer thread
pub struct PtraceEventSource {
    pid: u32,
    events: Receiver<CallEvent>,
    exit: Receiver<ProcessExit>,
    exit_status: Option<ProcessExit>,
    dropped: Arc<AtomicU64>,
    detach_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl PtraceEventSource {
    /// Fork and exec `command` under ptrace
    pub fn spawn(command: &[String], config: TracerConfig) -> Result<Self> {
        if command.is_empty() {
            anyhow::bail!("Command array is empty");
        }

        let (event_tx, event_rx) = bounded(config.channel_capacity.max(1));
        let (exit_tx, exit_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded::<Result<Pid>>(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let detach_requested = Arc::new(AtomicBool::new(false));

        let tracer = Tracer {
            marker_syscall: config.marker_syscall,
            events: event_tx,
            exit: exit_tx,
            dropped: Arc::clone(&dropped),
            detach_requested: Arc::clone(&detach_requested),
        };
        let command = command.to_vec();

        // ptrace requests must come from the thread that became the tracer
        let handle = std::thread::Builder::new()
            .name("libsandbox-tracer".to_string())
            .spawn(move || {
                let child = match start_traced(&command) {
                    Ok(child) => child,
                    Err(e) => {
                        let message = format!("{:#}", e);
                        let _ = ready_tx.send(Err(e));
                        anyhow::bail!(message);
                    }
                };
                let _ = ready_tx.send(Ok(child));
                tracer.run(child)
            })
            .context("Failed to spawn tracer thread")?;

        let child = ready_rx
            .recv()
            .context("Tracer thread exited before the target started")??;
        debug!(pid = child.as_raw(), "target started under ptrace");

        Ok(Self {
            pid: child.as_raw() as u32,
            events: event_rx,
            exit: exit_rx,
            exit_status: None,
            dropped,
            detach_requested,
            handle: Some(handle),
        })
    }

    fn target(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

impl EventSource for PtraceEventSource {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll_event(&mut self, timeout: Duration) -> Option<CallEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        if self.exit_status.is_some() {
            return Ok(self.exit_status);
        }
        if let Ok(exit) = self.exit.try_recv() {
            self.exit_status = Some(exit);
            return Ok(self.exit_status);
        }

        // Tracer thread gone without an exit status means it failed
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            if let Some(handle) = self.handle.take() {
                match handle.join() {
                    Ok(result) => result.context("Tracer thread failed")?,
                    Err(_) => anyhow::bail!("Tracer thread panicked"),
                }
            }
            if let Ok(exit) = self.exit.try_recv() {
                self.exit_status = Some(exit);
            }
        }
        Ok(self.exit_status)
    }

    fn kill(&mut self) -> Result<()> {
        match signal::kill(self.target(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e).context(format!("Failed to kill process {}", self.pid)),
        }
    }

    fn detach(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.detach_requested.store(true, Ordering::SeqCst);
        match signal::kill(self.target(), Signal::SIGSTOP) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e).context(format!("Failed to stop process {}", self.pid)),
        }

        // PTRACE_O_EXITKILL fires if the tracer thread goes away while still
        // attached, so wait until every thread has been released
        match handle.join() {
            Ok(result) => result.context("Tracer thread failed while detaching")?,
            Err(_) => anyhow::bail!("Tracer thread panicked"),
        }
        if let Ok(exit) = self.exit.try_recv() {
            self.exit_status = Some(exit);
        }
        debug!(pid = self.pid, "tracer released the target");
        Ok(())
    }

    fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Fork; the child requests tracing and execs the target
fn start_traced(command: &[String]) -> Result<Pid> {
    let program = &command[0];
    let args = &command[1..];

    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => {
            // Initial SIGTRAP from the exec following PTRACE_TRACEME
            waitpid(child, None).context("Failed to wait for child")?;
            let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
                | ptrace::Options::PTRACE_O_EXITKILL
                | ptrace::Options::PTRACE_O_TRACEEXEC
                | ptrace::Options::PTRACE_O_TRACECLONE;
            ptrace::setoptions(child, options).context("Failed to set ptrace options")?;
            Ok(child)
        }
        ForkResult::Child => {
            if let Err(e) = ptrace::traceme() {
                eprintln!("Failed to PTRACE_TRACEME: {}", e);
                std::process::exit(1);
            }
            let err = Command::new(program).args(args).exec();

            // Only reached when exec failed
            eprintln!("Failed to exec {}: {}", program, err);
            std::process::exit(1);
        }
    }
}

/// Send SIGSTOP to one thread of `tgid`
fn stop_thread(tgid: Pid, tid: Pid) -> Result<()> {
    // SAFETY: tgkill takes plain integers and only queues a signal
    let rc = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw(),
            tid.as_raw(),
            libc::SIGSTOP,
        )
    };
    match Errno::result(rc) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).context(format!("Failed to stop thread {}", tid)),
    }
}

/// Per-thread ptrace bookkeeping
#[derive(Debug, Default, Clone, Copy)]
struct ThreadState {
    /// Between a syscall-entry stop and its matching exit stop
    in_syscall: bool,
    /// Initial SIGSTOP of a cloned thread has been consumed
    started: bool,
}

struct Tracer {
    marker_syscall: i64,
    events: Sender<CallEvent>,
    exit: Sender<ProcessExit>,
    dropped: Arc<AtomicU64>,
    detach_requested: Arc<AtomicBool>,
}

impl Tracer {
    /// Trace `leader` and every thread it clones until the thread group
    /// exits or the session asks to detach
    fn run(self, leader: Pid) -> Result<()> {
        let mut threads: HashMap<Pid, ThreadState> = HashMap::new();
        threads.insert(
            leader,
            ThreadState {
                in_syscall: false,
                started: true,
            },
        );
        let mut detaching = false;

        ptrace::syscall(leader, None).context("Failed to PTRACE_SYSCALL")?;

        loop {
            // __WNOTHREAD keeps other tracer threads' tracees out of this wait
            let status = waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
            )
            .context("Failed to waitpid")?;

            let resume = match status {
                WaitStatus::Exited(tid, code) => {
                    if tid == leader {
                        debug!(code, "target exited");
                        let _ = self.exit.send(ProcessExit::Exited(code));
                        return Ok(());
                    }
                    trace!(tid = tid.as_raw(), code, "thread exited");
                    threads.remove(&tid);
                    None
                }
                WaitStatus::Signaled(tid, sig, _) => {
                    if tid == leader {
                        debug!(signal = ?sig, "target killed by signal");
                        let _ = self.exit.send(ProcessExit::Signaled(sig as i32));
                        return Ok(());
                    }
                    trace!(tid = tid.as_raw(), signal = ?sig, "thread killed");
                    threads.remove(&tid);
                    None
                }
                WaitStatus::PtraceSyscall(tid) => {
                    let state = threads.entry(tid).or_default();
                    if !state.in_syscall {
                        if let Some(call_id) = self.marker_call(tid)? {
                            self.forward(CallEvent {
                                pid: leader.as_raw() as u32,
                                call_id,
                            });
                        }
                    }
                    state.in_syscall = !state.in_syscall;
                    Some((tid, None))
                }
                WaitStatus::PtraceEvent(tid, _, event) => {
                    if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 {
                        let raw = ptrace::getevent(tid).context("Failed to read clone event")?;
                        let new_tid = Pid::from_raw(raw as i32);
                        threads.entry(new_tid).or_default();
                        debug!(tid = new_tid.as_raw(), "tracing new thread");
                    } else if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
                        // exec leaves only the leader; the syscall-exit stop follows
                        threads.retain(|t, _| *t == leader);
                        threads.insert(
                            leader,
                            ThreadState {
                                in_syscall: true,
                                started: true,
                            },
                        );
                    }
                    Some((tid, None))
                }
                WaitStatus::Stopped(tid, Signal::SIGSTOP) => {
                    let started = threads.get(&tid).is_some_and(|t| t.started);
                    if detaching || (started && self.detach_requested.load(Ordering::SeqCst)) {
                        if !detaching {
                            detaching = true;
                            for (other, state) in &threads {
                                if *other != tid && state.started {
                                    stop_thread(leader, *other)?;
                                }
                            }
                        }
                        // Detaching with no signal swallows our SIGSTOP
                        match ptrace::detach(tid, None) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => {
                                return Err(e)
                                    .context(format!("Failed to detach from thread {}", tid))
                            }
                        }
                        threads.remove(&tid);
                        if threads.is_empty() {
                            debug!(pid = leader.as_raw(), "detached, target left running");
                            return Ok(());
                        }
                        None
                    } else if !started {
                        threads.entry(tid).or_default().started = true;
                        Some((tid, None))
                    } else {
                        Some((tid, Some(Signal::SIGSTOP)))
                    }
                }
                WaitStatus::Stopped(tid, sig) => {
                    trace!(tid = tid.as_raw(), signal = ?sig, "re-injecting signal");
                    Some((tid, Some(sig)))
                }
                _ => None,
            };

            if let Some((tid, sig)) = resume {
                // The thread may already be gone after a group kill
                match ptrace::syscall(tid, sig) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return Err(e).context("Failed to PTRACE_SYSCALL"),
                }
            }
        }
    }

    fn forward(&self, event: CallEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 {
                    warn!("event queue full, dropping call events");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn marker_call(&self, child: Pid) -> Result<Option<CallId>> {
        let regs = ptrace::getregs(child).context("Failed to get registers")?;
        if regs.orig_rax as i64 == self.marker_syscall {
            Ok(Some(regs.rdi))
        } else {
            Ok(None)
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn marker_call(&self, _child: Pid) -> Result<Option<CallId>> {
        anyhow::bail!("Marker syscall decoding is only supported on x86_64")
    }
}
