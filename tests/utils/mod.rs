// Shared helpers for integration tests
#![allow(dead_code)]

use libsandbox::automaton::{Automaton, State, Symbol};
use libsandbox::config::FunctionTable;
use libsandbox::policy::parse_policy;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Write `content` to `dir/name`, creating parent directories
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// Policy `S0 -open-> S1 -read-> S1 -close-> S2`
pub fn file_policy() -> Automaton {
    parse_policy("S0\nS0 open S1\nS1 read S1\nS1 close S2\n").unwrap()
}

/// `{open: 1, read: 2, close: 3}`
pub fn file_functions() -> FunctionTable {
    [("open", 1), ("read", 2), ("close", 3)].into_iter().collect()
}

pub fn states(ids: &[&str]) -> BTreeSet<State> {
    ids.iter().map(|id| State::from(*id)).collect()
}

/// States reachable from `start` on `word`, following epsilon closures
pub fn simulate(automaton: &Automaton, word: &[Symbol]) -> BTreeSet<State> {
    let closure = |set: BTreeSet<State>| {
        let mut closed = set.clone();
        let mut stack: Vec<State> = set.into_iter().collect();
        while let Some(state) = stack.pop() {
            for next in automaton.transitions_from(&state, &Symbol::Epsilon) {
                if closed.insert(next.clone()) {
                    stack.push(next.clone());
                }
            }
        }
        closed
    };

    let mut current = closure([automaton.start().clone()].into_iter().collect());
    for symbol in word {
        let next = current
            .iter()
            .flat_map(|state| automaton.transitions_from(state, symbol))
            .cloned()
            .collect();
        current = closure(next);
    }
    current
}

/// Compile a C program with gcc into `dir/name`
pub fn compile_c(dir: &Path, name: &str, source: &str) -> PathBuf {
    let source_file = write_file(dir, &format!("{}.c", name), source);
    let binary = dir.join(name);
    let status = std::process::Command::new("gcc")
        .arg(&source_file)
        .arg("-pthread")
        .arg("-o")
        .arg(&binary)
        .status()
        .expect("Failed to compile test program");
    assert!(status.success(), "gcc failed for {}", name);
    binary
}

/// C source reporting `calls` through the default marker syscall, then
/// sleeping for `linger_secs`
pub fn marker_program(calls: &[u64], linger_secs: u32) -> String {
    let body: String = calls
        .iter()
        .map(|id| format!("    syscall(548, {}UL);\n", id))
        .collect();
    format!(
        "#include <unistd.h>\n#include <sys/syscall.h>\n\nint main(void) {{\n{}    sleep({});\n    return 0;\n}}\n",
        body, linger_secs
    )
}

/// Scheduler state letter from `/proc/<pid>/stat`, `None` once reaped
pub fn process_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}
