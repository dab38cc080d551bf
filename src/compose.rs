//! Interprocedural policy composition
//!
//! Every transition whose symbol names a function in the
//! [`PolicyDatabase`] is replaced by that function's variants, spliced in
//! with epsilon edges:
//!
//! ```text
//!   s --f--> {t1..tn}
//!
//! becomes, for each variant i of f (states prefixed per site and variant):
//!
//!   s --ε--> f_i.start      f_i.final --ε--> t1 .. tn
//! ```
//!
//! Inlining runs as a worklist of passes. Each pass consumes every pending
//! site and yields one new automaton; sites found inside freshly inlined
//! copies form the next pass. Each site remembers the chain of functions it
//! was inlined through, which is how recursion is detected.

use crate::automaton::{Automaton, State, Symbol};
use crate::database::PolicyDatabase;
use crate::reduce::{reduce, ReduceOptions};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error("recursive inlining of `{function}` (chain: {})", .chain.join(" -> "))]
    Recursion { function: String, chain: Vec<String> },

    #[error("variant {variant} of `{function}` has no final state")]
    MissingFinal { function: String, variant: usize },
}

/// What to do with a call edge whose function is already being inlined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecursionPolicy {
    /// Keep the edge as an uninterpreted call and report it
    #[default]
    Leaf,
    /// Fail composition with [`ComposeError::Recursion`]
    Reject,
}

/// A call edge left uninlined because of recursion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecursiveSite {
    pub state: State,
    pub function: String,
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositionReport {
    /// Worklist passes that inlined at least one site
    pub passes: usize,
    pub inlined_sites: usize,
    pub recursive_sites: Vec<RecursiveSite>,
}

/// Reduced automaton plus how it was obtained
#[derive(Debug, Clone)]
pub struct Composition {
    pub automaton: Automaton,
    pub report: CompositionReport,
}

#[derive(Debug, Clone)]
struct Site {
    state: State,
    function: String,
    chain: Vec<String>,
}

pub struct Composer<'db> {
    database: &'db PolicyDatabase,
    recursion: RecursionPolicy,
    reduce_options: ReduceOptions,
}

impl<'db> Composer<'db> {
    pub fn new(database: &'db PolicyDatabase) -> Self {
        Self {
            database,
            recursion: RecursionPolicy::default(),
            reduce_options: ReduceOptions::default(),
        }
    }

    pub fn with_recursion_policy(mut self, recursion: RecursionPolicy) -> Self {
        self.recursion = recursion;
        self
    }

    pub fn with_reduce_options(mut self, options: ReduceOptions) -> Self {
        self.reduce_options = options;
        self
    }

    /// Inline to a fixpoint, then reduce
    pub fn compose(&self, program: &Automaton) -> Result<Composition, ComposeError> {
        let (inlined, report) = self.inline(program)?;
        let automaton = reduce(&inlined, self.reduce_options);
        info!(
            passes = report.passes,
            inlined_sites = report.inlined_sites,
            recursive_sites = report.recursive_sites.len(),
            states = automaton.state_count(),
            transitions = automaton.transition_count(),
            "composed policy"
        );
        Ok(Composition { automaton, report })
    }

    /// Inline to a fixpoint without reducing
    pub fn inline(&self, program: &Automaton) -> Result<(Automaton, CompositionReport), ComposeError> {
        let mut report = CompositionReport::default();
        let mut current = program.clone();
        let mut pending = self.sites_in(program, program.all_states(), &[]);
        let mut next_site_id = 0usize;

        while !pending.is_empty() {
            let mut builder = current.to_builder();
            let mut discovered = Vec::new();
            let mut inlined_this_pass = 0usize;

            for site in pending {
                let symbol = Symbol::call(site.function.clone());
                if site.chain.contains(&site.function) {
                    let mut chain = site.chain.clone();
                    chain.push(site.function.clone());
                    if self.recursion == RecursionPolicy::Reject {
                        return Err(ComposeError::Recursion {
                            function: site.function,
                            chain,
                        });
                    }
                    warn!(
                        function = %site.function,
                        state = %site.state,
                        chain = %chain.join(" -> "),
                        "recursive call left uninlined"
                    );
                    report.recursive_sites.push(RecursiveSite {
                        state: site.state,
                        function: site.function,
                        chain,
                    });
                    continue;
                }

                let Some(successors) = builder.remove_entry(&site.state, &symbol) else {
                    continue;
                };

                let mut chain = site.chain.clone();
                chain.push(site.function.clone());

                for (variant_idx, variant) in
                    self.database.variants(&site.function).iter().enumerate()
                {
                    let final_state =
                        variant
                            .final_state()
                            .ok_or_else(|| ComposeError::MissingFinal {
                                function: site.function.clone(),
                                variant: variant_idx,
                            })?;

                    let prefix = format!("{}_{}@{}:", site.function, variant_idx, next_site_id);
                    let copy = variant.relabeled(|state| state.prefixed(&prefix));

                    for state in copy.all_states() {
                        builder.add_state(state.clone());
                    }
                    for (from, sym, to) in copy.triples() {
                        builder.add_transition(from.clone(), sym.clone(), to.clone());
                    }
                    builder.add_transition(
                        site.state.clone(),
                        Symbol::Epsilon,
                        copy.start().clone(),
                    );
                    let exit = final_state.prefixed(&prefix);
                    builder.add_state(exit.clone());
                    for target in &successors {
                        builder.add_transition(exit.clone(), Symbol::Epsilon, target.clone());
                    }

                    discovered.extend(self.sites_in(&copy, copy.all_states(), &chain));
                }

                next_site_id += 1;
                inlined_this_pass += 1;
            }

            current = builder.build();
            if inlined_this_pass > 0 {
                report.passes += 1;
                report.inlined_sites += inlined_this_pass;
                debug!(
                    pass = report.passes,
                    inlined = inlined_this_pass,
                    pending = discovered.len(),
                    "inlining pass complete"
                );
            }
            pending = discovered;
        }

        Ok((current, report))
    }

    fn sites_in(&self, automaton: &Automaton, states: &BTreeSet<State>, chain: &[String]) -> Vec<Site> {
        let mut sites = Vec::new();
        for state in states {
            for (symbol, _) in automaton.outgoing(state) {
                if let Some(name) = symbol.call_name() {
                    if self.database.contains(name) {
                        sites.push(Site {
                            state: state.clone(),
                            function: name.to_string(),
                            chain: chain.to_vec(),
                        });
                    }
                }
            }
        }
        sites
    }
}
