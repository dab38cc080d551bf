//! Graphviz rendering of policies
//!
//! [`to_dot`] emits the DOT text; [`render_png`] runs the external `dot`
//! binary under a hard deadline.

use crate::automaton::{Automaton, State};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default renderer deadline
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a render attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Rendered,
    /// Renderer exceeded the deadline and was killed
    TimedOut,
    /// Renderer ran but reported failure
    Failed(Option<i32>),
}

fn quote(state: &State) -> String {
    format!("\"{}\"", state.as_str().replace('\\', "\\\\").replace('"', "\\\""))
}

/// DOT id of the invisible node pointing at the start state
const ENTRY_NODE: &str = "\"entry point\"";

/// DOT text for `automaton`
///
/// Nodes are unlabeled circles, edges carry the call name (empty for
/// epsilon), and an invisible entry node points at the start state.
pub fn to_dot(automaton: &Automaton) -> String {
    let mut dot = String::new();
    dot.push_str("digraph NFA {\n");
    dot.push_str("\trankdir=LR;\n");
    dot.push_str("\tsplines=true;\n");
    dot.push_str("\toverlap=false;\n");
    dot.push_str("\tnode [shape=circle];\n");
    dot.push_str("\tnode [label=\"\"];\n");

    if let Some(final_state) = automaton.final_state() {
        let _ = writeln!(dot, "\t{} [shape=doublecircle];", quote(final_state));
    }
    for (from, symbol, to) in automaton.triples() {
        let label = symbol.call_name().unwrap_or("");
        let _ = writeln!(
            dot,
            "\t{} -> {} [label=\"{}\"];",
            quote(from),
            quote(to),
            label.replace('"', "\\\"")
        );
    }

    // Whitespace keeps the id apart from every state token
    let _ = writeln!(dot, "\t{} [shape=none];", ENTRY_NODE);
    let _ = writeln!(dot, "\t{} -> {};", ENTRY_NODE, quote(automaton.start()));
    dot.push_str("}\n");
    dot
}

/// Run `dot -Tpng` on `dot_path`, killing it after `deadline`
pub fn render_png(dot_path: &Path, png_path: &Path, deadline: Duration) -> Result<RenderStatus> {
    let mut child = Command::new("dot")
        .arg("-Tpng")
        .arg(dot_path)
        .arg("-o")
        .arg(png_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to run Graphviz `dot`")?;

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for `dot`")? {
            debug!(?status, elapsed = ?started.elapsed(), "dot finished");
            return Ok(if status.success() {
                RenderStatus::Rendered
            } else {
                RenderStatus::Failed(status.code())
            });
        }
        if started.elapsed() >= deadline {
            warn!(deadline = ?deadline, "dot exceeded deadline, killing renderer");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(RenderStatus::TimedOut);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
