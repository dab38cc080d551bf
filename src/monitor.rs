//! Online policy enforcement
//!
//! [`Frontier`] is the live set of automaton states consistent with every
//! call seen so far. Each enforced call replaces it wholesale with the union
//! of successors; an empty union means no state of the policy can continue
//! on that call, which is a violation.
//!
//! [`Monitor`] owns everything one monitoring session needs (policy,
//! function table, ignore set, target pid, frontier) and turns raw
//! `(pid, call id)` events into [`Decision`]s. There is no acceptance test:
//! the policy is a prefix check over an unbounded live sequence.

use crate::automaton::{Automaton, State, Symbol};
use crate::config::{CallId, FunctionTable};
use crate::filter::IgnoreSet;
use crate::stats::CallStats;
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// One occurrence reported by the event source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallEvent {
    pub pid: u32,
    pub call_id: CallId,
}

/// Set of states reachable given the calls consumed so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontier {
    states: BTreeSet<State>,
}

impl Frontier {
    /// `{start}`
    pub fn initial(policy: &Automaton) -> Self {
        Self {
            states: [policy.start().clone()].into_iter().collect(),
        }
    }

    /// Successor frontier on `symbol`; may be empty
    pub fn step(&self, policy: &Automaton, symbol: &Symbol) -> Frontier {
        let states = self
            .states
            .iter()
            .flat_map(|state| policy.transitions_from(state, symbol))
            .cloned()
            .collect();
        Frontier { states }
    }

    pub fn states(&self) -> &BTreeSet<State> {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, state: &State) -> bool {
        self.states.contains(state)
    }
}

/// Final ruling of a session; once reached it never changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No state of the frontier continues on `symbol`
    Violation { symbol: String, event_index: u64 },
    /// The event source reported an id missing from the function table
    UnresolvedCall { call_id: CallId, event_index: u64 },
}

/// What the monitor did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Event from another process
    Foreign,
    /// Call in the ignore set; frontier untouched
    Ignored,
    /// Frontier advanced and is non-empty
    Allowed { frontier_size: usize },
    /// Frontier emptied; the process must be killed
    Violation { symbol: String },
    /// Call id not in the function table; the process must be killed
    Unresolved { call_id: CallId },
    /// A verdict was already reached; event discarded
    Discarded,
}

impl Decision {
    /// Whether this decision requires terminating the monitored process
    pub fn requires_kill(&self) -> bool {
        matches!(self, Decision::Violation { .. } | Decision::Unresolved { .. })
    }
}

/// Counters over the events a monitor has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorCounters {
    pub foreign: u64,
    pub ignored: u64,
    pub allowed: u64,
    pub discarded: u64,
}

/// Enforcement context for one monitored process
#[derive(Debug)]
pub struct Monitor {
    policy: Automaton,
    functions: FunctionTable,
    ignores: IgnoreSet,
    pid: Option<u32>,
    frontier: Frontier,
    verdict: Option<Verdict>,
    events: u64,
    counters: MonitorCounters,
    stats: CallStats,
}

impl Monitor {
    pub fn new(policy: Automaton, functions: FunctionTable, ignores: IgnoreSet) -> Self {
        let frontier = Frontier::initial(&policy);
        Self {
            policy,
            functions,
            ignores,
            pid: None,
            frontier,
            verdict: None,
            events: 0,
            counters: MonitorCounters::default(),
            stats: CallStats::new(),
        }
    }

    /// Bind the monitor to the target process
    pub fn attach(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn policy(&self) -> &Automaton {
        &self.policy
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    pub fn counters(&self) -> MonitorCounters {
        self.counters
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Events from the monitored process that reached call resolution
    pub fn events_seen(&self) -> u64 {
        self.events
    }

    /// Handle one event from the (process-wide) event stream
    pub fn handle(&mut self, event: CallEvent) -> Decision {
        if self.pid != Some(event.pid) {
            self.counters.foreign += 1;
            return Decision::Foreign;
        }
        if self.verdict.is_some() {
            self.counters.discarded += 1;
            return Decision::Discarded;
        }

        let index = self.events;
        self.events += 1;

        let resolved = self.functions.resolve(event.call_id).map(str::to_string);
        let Some(name) = resolved else {
            warn!(call_id = event.call_id, event_index = index, "call id missing from function table");
            self.frontier = Frontier {
                states: BTreeSet::new(),
            };
            self.verdict = Some(Verdict::UnresolvedCall {
                call_id: event.call_id,
                event_index: index,
            });
            return Decision::Unresolved {
                call_id: event.call_id,
            };
        };
        self.advance_call(&name, index)
    }

    /// Advance on a resolved call name, honoring the ignore set
    pub fn advance(&mut self, call: &str) -> Decision {
        if self.verdict.is_some() {
            self.counters.discarded += 1;
            return Decision::Discarded;
        }
        let index = self.events;
        self.events += 1;
        self.advance_call(call, index)
    }

    fn advance_call(&mut self, call: &str, index: u64) -> Decision {
        if self.ignores.contains(call) {
            self.counters.ignored += 1;
            self.stats.record_ignored(call);
            return Decision::Ignored;
        }

        let symbol = Symbol::call(call);
        let next = self.frontier.step(&self.policy, &symbol);
        if next.is_empty() {
            warn!(
                call,
                event_index = index,
                frontier = ?self.frontier.states(),
                "policy violation: no continuation"
            );
            self.frontier = next;
            self.verdict = Some(Verdict::Violation {
                symbol: call.to_string(),
                event_index: index,
            });
            return Decision::Violation {
                symbol: call.to_string(),
            };
        }

        trace!(call, frontier_size = next.len(), "frontier advanced");
        self.counters.allowed += 1;
        self.stats.record_allowed(call);
        let frontier_size = next.len();
        self.frontier = next;
        Decision::Allowed { frontier_size }
    }
}
