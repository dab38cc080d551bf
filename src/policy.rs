//! Policy file formats
//!
//! Program policy (`.policy`):
//!
//! ```text
//! <start>
//! <state> <symbol> <next>
//! ...
//! ```
//!
//! Function policy (`.fpolicy`) carries an extra second line naming the
//! final state. In both, the symbol `0` stands for epsilon.

use crate::automaton::{Automaton, State, Symbol};
use anyhow::{Context, Result};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyParseError {
    #[error("policy is empty: expected a start state on line 1")]
    MissingStart,

    #[error("function policy has no final state on line 2")]
    MissingFinal,

    #[error("line {line}: expected `state symbol nextState`, found {found} token(s)")]
    WrongTokenCount { line: usize, found: usize },
}

fn parse_triple(line_no: usize, line: &str) -> Result<(State, Symbol, State), PolicyParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [from, symbol, to] => Ok((
            State::from(*from),
            Symbol::from_token(symbol),
            State::from(*to),
        )),
        _ => Err(PolicyParseError::WrongTokenCount {
            line: line_no,
            found: tokens.len(),
        }),
    }
}

/// Parse a whole-program policy
///
/// Blank lines after the start line are skipped; every other line must be a
/// triple.
pub fn parse_policy(text: &str) -> Result<Automaton, PolicyParseError> {
    let mut lines = text.lines().enumerate();
    let start = lines
        .by_ref()
        .map(|(_, line)| line.trim())
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(PolicyParseError::MissingStart)?;

    let mut triples = Vec::new();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        triples.push(parse_triple(idx + 1, line)?);
    }

    Ok(Automaton::from_triples(State::from(start), None, triples))
}

/// Parse a function-scoped policy (start, final, triples)
pub fn parse_function_policy(text: &str) -> Result<Automaton, PolicyParseError> {
    let mut lines = text.lines().enumerate();
    let start = match lines.next() {
        Some((_, line)) if !line.trim().is_empty() => line.trim(),
        _ => return Err(PolicyParseError::MissingStart),
    };
    let final_state = match lines.next() {
        Some((_, line)) if !line.trim().is_empty() => line.trim(),
        _ => return Err(PolicyParseError::MissingFinal),
    };

    let mut triples = Vec::new();
    for (idx, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        triples.push(parse_triple(idx + 1, line)?);
    }

    Ok(Automaton::from_triples(
        State::from(start),
        Some(State::from(final_state)),
        triples,
    ))
}

/// Render a program policy in the on-disk format
pub fn write_policy(automaton: &Automaton) -> String {
    let mut out = String::new();
    out.push_str(automaton.start().as_str());
    out.push('\n');
    for (from, symbol, to) in automaton.triples() {
        out.push_str(&format!("{} {} {}\n", from, symbol.as_token(), to));
    }
    out
}

/// Render a function policy (with its final-state line)
pub fn write_function_policy(automaton: &Automaton) -> String {
    let mut out = String::new();
    out.push_str(automaton.start().as_str());
    out.push('\n');
    if let Some(final_state) = automaton.final_state() {
        out.push_str(final_state.as_str());
    }
    out.push('\n');
    for (from, symbol, to) in automaton.triples() {
        out.push_str(&format!("{} {} {}\n", from, symbol.as_token(), to));
    }
    out
}

pub fn load_policy<P: AsRef<Path>>(path: P) -> Result<Automaton> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    parse_policy(&text).with_context(|| format!("Malformed policy file {}", path.display()))
}

pub fn load_function_policy<P: AsRef<Path>>(path: P) -> Result<Automaton> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read function policy {}", path.display()))?;
    parse_function_policy(&text)
        .with_context(|| format!("Malformed function policy {}", path.display()))
}

pub fn save_policy<P: AsRef<Path>>(automaton: &Automaton, path: P) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, write_policy(automaton))
        .with_context(|| format!("Failed to write policy file {}", path.display()))
}
