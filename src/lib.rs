//! libsandbox - Library-call sandbox driven by automaton policies
//!
//! Policies are nondeterministic automata over library-call names. This
//! crate builds them (reduction, database of function policies, inlining
//! composition) and enforces them online against a running process.

pub mod automaton;
pub mod cli;
pub mod compose;
pub mod config;
pub mod database;
pub mod filter;
pub mod json_output;
pub mod monitor;
pub mod policy;
pub mod reduce;
pub mod render;
pub mod session;
pub mod signal;
pub mod stats;
pub mod tracer;
