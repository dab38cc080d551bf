//! JSON output format for enforcement reports
//!
//! `--format json` prints one document to stdout after the session ends.

use crate::session::{SessionOutcome, SessionReport};
use crate::stats::{CallCounts, CallStats};
use crate::tracer::ProcessExit;
use serde::{Deserialize, Serialize};

/// How the monitored process ended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonExit {
    /// "exited" or "signaled"
    pub kind: String,
    /// Exit code or signal number
    pub value: i32,
}

impl From<ProcessExit> for JsonExit {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Exited(code) => JsonExit {
                kind: "exited".to_string(),
                value: code,
            },
            ProcessExit::Signaled(sig) => JsonExit {
                kind: "signaled".to_string(),
                value: sig,
            },
        }
    }
}

/// Per-call counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonCall {
    pub name: String,
    pub allowed: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonSummary {
    pub events_seen: u64,
    pub allowed: u64,
    pub ignored: u64,
    pub foreign: u64,
    pub discarded: u64,
    pub dropped: u64,
    pub exit_code: i32,
}

/// Complete report for one monitored run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonOutput {
    pub version: String,
    pub format: String,
    pub executable: String,
    pub pid: u32,
    /// SHA-256 of the canonical policy text
    pub policy_fingerprint: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violating_call: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unresolved_call_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<JsonExit>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub calls: Vec<JsonCall>,
    pub summary: JsonSummary,
}

impl JsonOutput {
    pub fn new(executable: impl Into<String>, policy_fingerprint: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "libsandbox-json-v1".to_string(),
            executable: executable.into(),
            pid: 0,
            policy_fingerprint: policy_fingerprint.into(),
            outcome: String::new(),
            violating_call: None,
            violation_index: None,
            unresolved_call_id: None,
            exit: None,
            calls: Vec::new(),
            summary: JsonSummary {
                events_seen: 0,
                allowed: 0,
                ignored: 0,
                foreign: 0,
                discarded: 0,
                dropped: 0,
                exit_code: 0,
            },
        }
    }

    pub fn set_report(&mut self, report: &SessionReport) {
        self.pid = report.pid;
        self.outcome = report.outcome.label().to_string();
        match &report.outcome {
            SessionOutcome::Violation {
                symbol,
                event_index,
                ..
            } => {
                self.violating_call = Some(symbol.clone());
                self.violation_index = Some(*event_index);
            }
            SessionOutcome::UnresolvedCall { call_id, .. } => {
                self.unresolved_call_id = Some(*call_id);
            }
            SessionOutcome::Completed { .. } | SessionOutcome::Aborted => {}
        }
        self.exit = report.outcome.process_exit().map(JsonExit::from);
        self.summary = JsonSummary {
            events_seen: report.events_seen,
            allowed: report.counters.allowed,
            ignored: report.counters.ignored,
            foreign: report.counters.foreign,
            discarded: report.counters.discarded,
            dropped: report.dropped_events,
            exit_code: report.outcome.exit_code(),
        };
    }

    pub fn set_calls(&mut self, stats: &CallStats) {
        self.calls = stats
            .sorted()
            .into_iter()
            .map(|(name, CallCounts { allowed, ignored })| JsonCall {
                name: name.to_string(),
                allowed,
                ignored,
            })
            .collect();
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
