//! Enforcement loop
//!
//! Single consumer of an [`EventSource`]. Each iteration polls one event
//! with a bounded timeout, then re-checks process liveness and the operator
//! interrupt. A kill decision is final: the loop keeps draining until the
//! process exit is observed and discards whatever still arrives.

use crate::config::{CallId, DEFAULT_POLL_INTERVAL_MS};
use crate::monitor::{CallEvent, Decision, Monitor, MonitorCounters, Verdict};
use crate::tracer::{EventSource, ProcessExit};
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, info};

/// Exit status of the binary when a violation killed the process
pub const EXIT_VIOLATION: i32 = 3;
/// Exit status when an unresolved call id killed the process
pub const EXIT_UNRESOLVED: i32 = 4;
/// Exit status after an operator interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on one `poll_event` wait
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Process ran to completion without leaving the policy
    Completed { exit: ProcessExit },
    /// Process was killed for a call the policy does not allow
    Violation {
        symbol: String,
        event_index: u64,
        exit: ProcessExit,
    },
    /// Process was killed for reporting an unknown call id
    UnresolvedCall { call_id: CallId, exit: ProcessExit },
    /// Operator interrupt; the process was left running
    Aborted,
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Completed { exit } => exit.code(),
            SessionOutcome::Violation { .. } => EXIT_VIOLATION,
            SessionOutcome::UnresolvedCall { .. } => EXIT_UNRESOLVED,
            SessionOutcome::Aborted => EXIT_INTERRUPTED,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed { .. } => "completed",
            SessionOutcome::Violation { .. } => "violation",
            SessionOutcome::UnresolvedCall { .. } => "unresolved_call",
            SessionOutcome::Aborted => "aborted",
        }
    }

    pub fn process_exit(&self) -> Option<ProcessExit> {
        match self {
            SessionOutcome::Completed { exit }
            | SessionOutcome::Violation { exit, .. }
            | SessionOutcome::UnresolvedCall { exit, .. } => Some(*exit),
            SessionOutcome::Aborted => None,
        }
    }
}

/// Result of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub pid: u32,
    pub outcome: SessionOutcome,
    pub events_seen: u64,
    pub counters: MonitorCounters,
    pub dropped_events: u64,
}

/// Run `monitor` against `source` until the process exits or `interrupted`
/// returns true
pub fn run_session<S: EventSource + ?Sized>(
    monitor: &mut Monitor,
    source: &mut S,
    options: &SessionOptions,
    interrupted: &dyn Fn() -> bool,
) -> Result<SessionReport> {
    let pid = source.pid();
    monitor.attach(pid);
    let mut kill_sent = false;

    let outcome = loop {
        if let Some(event) = source.poll_event(options.poll_interval) {
            dispatch(monitor, source, event, &mut kill_sent)?;
        } else if let Some(exit) = source.try_wait()? {
            while let Some(event) = source.poll_event(Duration::ZERO) {
                dispatch(monitor, source, event, &mut kill_sent)?;
            }
            break finish(monitor, exit);
        }

        if !kill_sent && interrupted() {
            source.detach()?;
            eprintln!("[libsandbox: Interrupted, process {} left running]", pid);
            break SessionOutcome::Aborted;
        }
    };

    info!(outcome = outcome.label(), events = monitor.events_seen(), "session finished");
    Ok(SessionReport {
        pid,
        outcome,
        events_seen: monitor.events_seen(),
        counters: monitor.counters(),
        dropped_events: source.dropped_events(),
    })
}

fn dispatch<S: EventSource + ?Sized>(
    monitor: &mut Monitor,
    source: &mut S,
    event: CallEvent,
    kill_sent: &mut bool,
) -> Result<()> {
    let decision = monitor.handle(event);
    if !decision.requires_kill() || *kill_sent {
        return Ok(());
    }

    match &decision {
        Decision::Violation { symbol } => eprintln!(
            "[libsandbox: Policy violation on call `{}`, killing process {}]",
            symbol, event.pid
        ),
        Decision::Unresolved { call_id } => eprintln!(
            "[libsandbox: Unknown call id {}, killing process {}]",
            call_id, event.pid
        ),
        _ => {}
    }
    source.kill()?;
    *kill_sent = true;
    debug!(pid = event.pid, "kill issued, draining until exit");
    Ok(())
}

fn finish(monitor: &Monitor, exit: ProcessExit) -> SessionOutcome {
    match monitor.verdict() {
        Some(Verdict::Violation {
            symbol,
            event_index,
        }) => SessionOutcome::Violation {
            symbol: symbol.clone(),
            event_index: *event_index,
            exit,
        },
        Some(Verdict::UnresolvedCall { call_id, .. }) => SessionOutcome::UnresolvedCall {
            call_id: *call_id,
            exit,
        },
        None => SessionOutcome::Completed { exit },
    }
}
