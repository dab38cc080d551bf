//! Automaton reduction
//!
//! - [`eliminate_epsilon`]: epsilon-NFA to NFA, language preserving
//! - [`fold_entry_closure`]: merge epsilon-equivalent entry states into start
//! - [`prune_unreachable`]: drop states not reachable from start
//!
//! Each pass consumes a borrowed automaton and returns a new one.

use crate::automaton::{Automaton, AutomatonBuilder, State, Symbol};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Epsilon closure of a single state, computed on demand
pub fn epsilon_closure(automaton: &Automaton, state: &State) -> BTreeSet<State> {
    let mut closure = BTreeSet::new();
    closure.insert(state.clone());
    let mut stack = vec![state.clone()];

    while let Some(current) = stack.pop() {
        for next in automaton.transitions_from(&current, &Symbol::Epsilon) {
            if closure.insert(next.clone()) {
                stack.push(next.clone());
            }
        }
    }

    closure
}

/// Epsilon closures of every state of one automaton
#[derive(Debug, Clone)]
pub struct EpsilonClosures {
    closures: BTreeMap<State, BTreeSet<State>>,
}

impl EpsilonClosures {
    pub fn compute(automaton: &Automaton) -> Self {
        let closures = automaton
            .all_states()
            .iter()
            .map(|state| (state.clone(), epsilon_closure(automaton, state)))
            .collect();
        Self { closures }
    }

    /// Closure of `state`; states outside the automaton close over themselves
    pub fn of(&self, state: &State) -> BTreeSet<State> {
        self.closures
            .get(state)
            .cloned()
            .unwrap_or_else(|| [state.clone()].into_iter().collect())
    }

    fn get(&self, state: &State) -> Option<&BTreeSet<State>> {
        self.closures.get(state)
    }
}

/// Remove every epsilon entry without changing the accepted continuations
///
/// For each state `s` and call symbol `a`, the new successor set is the union
/// of `closure(t)` over every `t` with `q --a--> t` for some `q` in
/// `closure(s)`.
pub fn eliminate_epsilon(automaton: &Automaton) -> Automaton {
    if !automaton.has_epsilon() {
        return automaton.clone();
    }

    let closures = EpsilonClosures::compute(automaton);
    let mut builder = AutomatonBuilder::new(automaton.start().clone());
    if let Some(final_state) = automaton.final_state() {
        builder.set_final(final_state.clone());
    }

    for state in automaton.all_states() {
        builder.add_state(state.clone());
        let Some(closure) = closures.get(state) else {
            continue;
        };
        for member in closure {
            for (symbol, targets) in automaton.outgoing(member) {
                if symbol.is_epsilon() {
                    continue;
                }
                builder.declare(state.clone(), symbol.clone());
                for target in targets {
                    for widened in closures.of(target) {
                        builder.add_transition(state.clone(), symbol.clone(), widened);
                    }
                }
            }
        }
    }

    let reduced = builder.build();
    debug!(
        states = reduced.state_count(),
        transitions = reduced.transition_count(),
        "eliminated epsilon transitions"
    );
    reduced
}

/// Merge the epsilon-equivalent part of the entry region into `start`
///
/// A member `c` of `closure(start)` is folded when `closure(c)` equals
/// `closure(start)`: such a state is indistinguishable from `start`. Edges
/// into `c` are redirected to `start`, `c`'s outgoing entries move to
/// `start`, and `c` is deleted.
pub fn fold_entry_closure(automaton: &Automaton) -> Automaton {
    let start = automaton.start();
    let entry = epsilon_closure(automaton, start);
    let folded: BTreeSet<State> = entry
        .iter()
        .filter(|member| *member != start && epsilon_closure(automaton, member) == entry)
        .cloned()
        .collect();

    if folded.is_empty() {
        return automaton.clone();
    }

    let rename = |state: &State| {
        if folded.contains(state) {
            start.clone()
        } else {
            state.clone()
        }
    };

    let mut builder = AutomatonBuilder::new(start.clone());
    if let Some(final_state) = automaton.final_state() {
        builder.set_final(rename(final_state));
    }
    for state in automaton.all_states() {
        builder.add_state(rename(state));
    }
    for (from, symbol, to) in automaton.triples() {
        let (from, to) = (rename(from), rename(to));
        if symbol.is_epsilon() && from == to {
            continue;
        }
        builder.add_transition(from, symbol.clone(), to);
    }
    for (from, by_symbol) in automaton.relation() {
        for (symbol, targets) in by_symbol {
            if targets.is_empty() {
                builder.declare(rename(from), symbol.clone());
            }
        }
    }

    debug!(folded = folded.len(), "folded entry closure into start state");
    builder.build()
}

/// Keep only states reachable from `start`
///
/// Targets pointing at discarded states are stripped. Idempotent.
pub fn prune_unreachable(automaton: &Automaton) -> Automaton {
    let start = automaton.start();
    let mut reachable = BTreeSet::new();
    reachable.insert(start.clone());
    let mut stack = vec![start.clone()];

    while let Some(current) = stack.pop() {
        for (_, targets) in automaton.outgoing(&current) {
            for target in targets {
                if reachable.insert(target.clone()) {
                    stack.push(target.clone());
                }
            }
        }
    }

    let mut builder = AutomatonBuilder::new(start.clone());
    if let Some(final_state) = automaton.final_state().filter(|f| reachable.contains(*f)) {
        builder.set_final(final_state.clone());
    }
    for state in &reachable {
        builder.add_state(state.clone());
        for (symbol, targets) in automaton.outgoing(state) {
            builder.declare(state.clone(), symbol.clone());
            for target in targets.iter().filter(|t| reachable.contains(*t)) {
                builder.add_transition(state.clone(), symbol.clone(), target.clone());
            }
        }
    }

    let pruned = builder.build();
    debug!(
        removed = automaton.state_count() - pruned.state_count(),
        "pruned unreachable states"
    );
    pruned
}

/// Knobs for [`reduce`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceOptions {
    /// Apply [`fold_entry_closure`] before epsilon elimination
    pub fold_entry_closure: bool,
}

/// Full reduction pipeline: (fold), eliminate epsilon, prune
pub fn reduce(automaton: &Automaton, options: ReduceOptions) -> Automaton {
    let folded;
    let input = if options.fold_entry_closure {
        folded = fold_entry_closure(automaton);
        &folded
    } else {
        automaton
    };
    prune_unreachable(&eliminate_epsilon(input))
}
