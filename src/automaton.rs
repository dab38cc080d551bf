//! Nondeterministic call automata
//!
//! An [`Automaton`] is an immutable value: a set of states, a labeled
//! transition relation where one `(state, symbol)` pair may lead to several
//! successors, a start state, and an optional final state (carried by
//! function-scoped automata used during composition).
//!
//! Transformations never patch an existing automaton. They copy it into an
//! [`AutomatonBuilder`], edit the builder, and `build()` a fresh value.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque state identifier, unique within one automaton
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same identifier with `prefix` prepended
    pub fn prefixed(&self, prefix: &str) -> Self {
        Self(format!("{}{}", prefix, self.0))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for State {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transition label: a call name, or epsilon (no call consumed)
///
/// Serialized as its policy-file token so it can key maps in any format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Symbol {
    Epsilon,
    Call(String),
}

impl Symbol {
    /// Token that stands for epsilon in policy files
    pub const EPSILON_TOKEN: &'static str = "0";

    pub fn call(name: impl Into<String>) -> Self {
        Symbol::Call(name.into())
    }

    /// Interpret a policy-file token (`0` is epsilon)
    pub fn from_token(token: &str) -> Self {
        if token == Self::EPSILON_TOKEN {
            Symbol::Epsilon
        } else {
            Symbol::Call(token.to_string())
        }
    }

    /// Policy-file token for this symbol
    pub fn as_token(&self) -> &str {
        match self {
            Symbol::Epsilon => Self::EPSILON_TOKEN,
            Symbol::Call(name) => name,
        }
    }

    pub fn is_epsilon(&self) -> bool {
        matches!(self, Symbol::Epsilon)
    }

    pub fn call_name(&self) -> Option<&str> {
        match self {
            Symbol::Epsilon => None,
            Symbol::Call(name) => Some(name),
        }
    }
}

impl From<String> for Symbol {
    fn from(token: String) -> Self {
        Symbol::from_token(&token)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        match symbol {
            Symbol::Epsilon => Symbol::EPSILON_TOKEN.to_string(),
            Symbol::Call(name) => name,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Epsilon => f.write_str("ε"),
            Symbol::Call(name) => f.write_str(name),
        }
    }
}

/// `State × Symbol → Set<State>`
pub type TransitionRelation = BTreeMap<State, BTreeMap<Symbol, BTreeSet<State>>>;

static NO_STATES: BTreeSet<State> = BTreeSet::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automaton {
    states: BTreeSet<State>,
    transitions: TransitionRelation,
    start: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_state: Option<State>,
}

impl Automaton {
    /// Build from `(state, symbol, next)` triples
    ///
    /// Every state named by a triple, the start state, and the final state
    /// (if any) become members of the state set.
    pub fn from_triples<I>(start: State, final_state: Option<State>, triples: I) -> Self
    where
        I: IntoIterator<Item = (State, Symbol, State)>,
    {
        let mut builder = AutomatonBuilder::new(start);
        if let Some(final_state) = final_state {
            builder.set_final(final_state);
        }
        for (from, symbol, to) in triples {
            builder.add_transition(from, symbol, to);
        }
        builder.build()
    }

    pub fn start(&self) -> &State {
        &self.start
    }

    pub fn final_state(&self) -> Option<&State> {
        self.final_state.as_ref()
    }

    /// Successors of `state` on `symbol`; empty when there is no continuation
    pub fn transitions_from(&self, state: &State, symbol: &Symbol) -> &BTreeSet<State> {
        self.transitions
            .get(state)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .unwrap_or(&NO_STATES)
    }

    /// All outgoing entries of `state`, keyed by symbol
    pub fn outgoing(&self, state: &State) -> impl Iterator<Item = (&Symbol, &BTreeSet<State>)> {
        self.transitions
            .get(state)
            .into_iter()
            .flat_map(|by_symbol| by_symbol.iter())
    }

    pub fn all_states(&self) -> &BTreeSet<State> {
        &self.states
    }

    /// Every symbol labeling at least one entry of the relation
    pub fn all_symbols(&self) -> BTreeSet<&Symbol> {
        self.transitions
            .values()
            .flat_map(|by_symbol| by_symbol.keys())
            .collect()
    }

    pub fn contains_state(&self, state: &State) -> bool {
        self.states.contains(state)
    }

    pub fn relation(&self) -> &TransitionRelation {
        &self.transitions
    }

    /// Flattened `(state, symbol, next)` view in canonical order
    pub fn triples(&self) -> impl Iterator<Item = (&State, &Symbol, &State)> {
        self.transitions.iter().flat_map(|(from, by_symbol)| {
            by_symbol
                .iter()
                .flat_map(move |(symbol, targets)| targets.iter().map(move |to| (from, symbol, to)))
        })
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions
            .values()
            .flat_map(|by_symbol| by_symbol.values())
            .map(BTreeSet::len)
            .sum()
    }

    pub fn has_epsilon(&self) -> bool {
        self.transitions
            .values()
            .any(|by_symbol| by_symbol.contains_key(&Symbol::Epsilon))
    }

    /// Copy this automaton into a builder for deriving a new value
    pub fn to_builder(&self) -> AutomatonBuilder {
        AutomatonBuilder {
            states: self.states.clone(),
            transitions: self.transitions.clone(),
            start: self.start.clone(),
            final_state: self.final_state.clone(),
        }
    }

    /// New automaton with every state passed through `rename`
    pub fn relabeled<F>(&self, rename: F) -> Automaton
    where
        F: Fn(&State) -> State,
    {
        let mut builder = AutomatonBuilder::new(rename(&self.start));
        if let Some(final_state) = &self.final_state {
            builder.set_final(rename(final_state));
        }
        for state in &self.states {
            builder.add_state(rename(state));
        }
        for (from, by_symbol) in &self.transitions {
            for (symbol, targets) in by_symbol {
                let from = rename(from);
                builder.declare(from.clone(), symbol.clone());
                for to in targets {
                    builder.add_transition(from.clone(), symbol.clone(), rename(to));
                }
            }
        }
        builder.build()
    }

    /// SHA-256 over the canonical policy text, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.start.as_str().as_bytes());
        hasher.update(b"\n");
        if let Some(final_state) = &self.final_state {
            hasher.update(final_state.as_str().as_bytes());
            hasher.update(b"\n");
        }
        for (from, symbol, to) in self.triples() {
            hasher.update(format!("{} {} {}\n", from, symbol.as_token(), to).as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Mutable staging area for constructing an [`Automaton`]
#[derive(Debug, Clone)]
pub struct AutomatonBuilder {
    states: BTreeSet<State>,
    transitions: TransitionRelation,
    start: State,
    final_state: Option<State>,
}

impl AutomatonBuilder {
    pub fn new(start: State) -> Self {
        let mut states = BTreeSet::new();
        states.insert(start.clone());
        Self {
            states,
            transitions: TransitionRelation::new(),
            start,
            final_state: None,
        }
    }

    pub fn add_state(&mut self, state: State) -> &mut Self {
        self.states.insert(state);
        self
    }

    pub fn set_final(&mut self, state: State) -> &mut Self {
        self.states.insert(state.clone());
        self.final_state = Some(state);
        self
    }

    pub fn add_transition(&mut self, from: State, symbol: Symbol, to: State) -> &mut Self {
        self.states.insert(from.clone());
        self.states.insert(to.clone());
        self.transitions
            .entry(from)
            .or_default()
            .entry(symbol)
            .or_default()
            .insert(to);
        self
    }

    /// Record an entry for `(from, symbol)` even if it has no successors yet
    pub fn declare(&mut self, from: State, symbol: Symbol) -> &mut Self {
        self.states.insert(from.clone());
        self.transitions.entry(from).or_default().entry(symbol).or_default();
        self
    }

    /// Drop the `(from, symbol)` entry, returning its successors
    pub fn remove_entry(&mut self, from: &State, symbol: &Symbol) -> Option<BTreeSet<State>> {
        let by_symbol = self.transitions.get_mut(from)?;
        let removed = by_symbol.remove(symbol);
        if by_symbol.is_empty() {
            self.transitions.remove(from);
        }
        removed
    }

    pub fn build(self) -> Automaton {
        Automaton {
            states: self.states,
            transitions: self.transitions,
            start: self.start,
            final_state: self.final_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(id: &str) -> State {
        State::from(id)
    }

    fn sample() -> Automaton {
        Automaton::from_triples(
            s("S0"),
            None,
            [
                (s("S0"), Symbol::call("open"), s("S1")),
                (s("S1"), Symbol::call("read"), s("S1")),
                (s("S1"), Symbol::call("close"), s("S2")),
                (s("S1"), Symbol::call("close"), s("S3")),
            ],
        )
    }

    #[test]
    fn test_from_triples_collects_states() {
        let a = sample();
        assert_eq!(a.state_count(), 4);
        assert!(a.contains_state(&s("S3")));
        assert_eq!(a.start(), &s("S0"));
        assert!(a.final_state().is_none());
    }

    #[test]
    fn test_transitions_from_is_multivalued() {
        let a = sample();
        let targets = a.transitions_from(&s("S1"), &Symbol::call("close"));
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&s("S2")));
        assert!(targets.contains(&s("S3")));
    }

    #[test]
    fn test_transitions_from_missing_entry_is_empty() {
        let a = sample();
        assert!(a.transitions_from(&s("S2"), &Symbol::call("read")).is_empty());
        assert!(a.transitions_from(&s("nope"), &Symbol::call("read")).is_empty());
    }

    #[test]
    fn test_all_symbols() {
        let a = sample();
        let symbols: Vec<_> = a.all_symbols().into_iter().cloned().collect();
        assert_eq!(
            symbols,
            vec![Symbol::call("close"), Symbol::call("open"), Symbol::call("read")]
        );
    }

    #[test]
    fn test_transition_count() {
        assert_eq!(sample().transition_count(), 4);
    }

    #[test]
    fn test_epsilon_token_round_trip() {
        assert_eq!(Symbol::from_token("0"), Symbol::Epsilon);
        assert_eq!(Symbol::Epsilon.as_token(), "0");
        assert_eq!(Symbol::from_token("malloc"), Symbol::call("malloc"));
        assert!(Symbol::Epsilon.is_epsilon());
        assert_eq!(Symbol::call("free").call_name(), Some("free"));
    }

    #[test]
    fn test_has_epsilon() {
        assert!(!sample().has_epsilon());
        let a = Automaton::from_triples(s("0"), None, [(s("0"), Symbol::Epsilon, s("1"))]);
        assert!(a.has_epsilon());
    }

    #[test]
    fn test_relabeled_keeps_structure() {
        let a = sample();
        let b = a.relabeled(|st| st.prefixed("f_0_"));
        assert_eq!(b.start(), &s("f_0_S0"));
        assert_eq!(b.transition_count(), a.transition_count());
        assert_eq!(
            b.transitions_from(&s("f_0_S1"), &Symbol::call("read")),
            &[s("f_0_S1")].into_iter().collect()
        );
    }

    #[test]
    fn test_to_builder_does_not_alias_original() {
        let a = sample();
        let mut builder = a.to_builder();
        builder.remove_entry(&s("S0"), &Symbol::call("open"));
        let b = builder.build();
        assert_eq!(a.transitions_from(&s("S0"), &Symbol::call("open")).len(), 1);
        assert!(b.transitions_from(&s("S0"), &Symbol::call("open")).is_empty());
    }

    #[test]
    fn test_declare_keeps_empty_entry() {
        let mut builder = AutomatonBuilder::new(s("0"));
        builder.declare(s("0"), Symbol::call("read"));
        let a = builder.build();
        assert!(a.transitions_from(&s("0"), &Symbol::call("read")).is_empty());
        assert_eq!(a.all_symbols().len(), 1);
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let mut builder = a.to_builder();
        builder.add_transition(s("S2"), Symbol::call("open"), s("S1"));
        assert_ne!(builder.build().fingerprint(), a.fingerprint());
    }

    #[test]
    fn test_serde_json_round_trip() {
        let a = sample();
        let json = serde_json::to_string(&a).unwrap();
        let back: Automaton = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
