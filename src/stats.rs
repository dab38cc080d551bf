//! Per-call statistics for -c mode

use serde::Serialize;
use std::collections::HashMap;

/// Counters for one call name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallCounts {
    pub allowed: u64,
    pub ignored: u64,
}

impl CallCounts {
    pub fn total(&self) -> u64 {
        self.allowed + self.ignored
    }
}

/// Tracks how often each call was seen by the monitor
#[derive(Debug, Default, Clone)]
pub struct CallStats {
    calls: HashMap<String, CallCounts>,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allowed(&mut self, call: &str) {
        self.calls.entry(call.to_string()).or_default().allowed += 1;
    }

    pub fn record_ignored(&mut self, call: &str) {
        self.calls.entry(call.to_string()).or_default().ignored += 1;
    }

    pub fn get(&self, call: &str) -> Option<&CallCounts> {
        self.calls.get(call)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Calls sorted by total count, descending, then by name
    pub fn sorted(&self) -> Vec<(&str, CallCounts)> {
        let mut sorted: Vec<_> = self
            .calls
            .iter()
            .map(|(name, counts)| (name.as_str(), *counts))
            .collect();
        sorted.sort_by(|a, b| b.1.total().cmp(&a.1.total()).then_with(|| a.0.cmp(b.0)));
        sorted
    }

    pub fn totals(&self) -> CallCounts {
        self.calls.values().fold(CallCounts::default(), |acc, c| CallCounts {
            allowed: acc.allowed + c.allowed,
            ignored: acc.ignored + c.ignored,
        })
    }

    /// Render the summary table
    pub fn format_summary(&self) -> String {
        if self.calls.is_empty() {
            return "No calls monitored.\n".to_string();
        }

        let total = self.totals();
        let mut out = String::new();
        out.push_str("% calls     calls   allowed   ignored call\n");
        out.push_str("------- --------- --------- --------- ----------------\n");
        for (name, counts) in self.sorted() {
            let percent = if total.total() > 0 {
                counts.total() as f64 / total.total() as f64 * 100.0
            } else {
                0.0
            };
            out.push_str(&format!(
                "{:7.2} {:>9} {:>9} {:>9} {}\n",
                percent,
                counts.total(),
                counts.allowed,
                if counts.ignored > 0 {
                    counts.ignored.to_string()
                } else {
                    String::new()
                },
                name
            ));
        }
        out.push_str("------- --------- --------- --------- ----------------\n");
        out.push_str(&format!(
            " 100.00 {:>9} {:>9} {:>9} total\n",
            total.total(),
            total.allowed,
            total.ignored
        ));
        out
    }

    /// Print the summary table to stderr (matching strace -c placement)
    pub fn print_summary(&self) {
        eprint!("{}", self.format_summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_allowed_and_ignored() {
        let mut stats = CallStats::new();
        stats.record_allowed("read");
        stats.record_allowed("read");
        stats.record_ignored("printf");

        assert_eq!(stats.get("read").unwrap().allowed, 2);
        assert_eq!(stats.get("printf").unwrap().ignored, 1);
        assert_eq!(stats.totals().total(), 3);
    }

    #[test]
    fn test_sorted_by_count_then_name() {
        let mut stats = CallStats::new();
        stats.record_allowed("b");
        stats.record_allowed("a");
        stats.record_allowed("c");
        stats.record_allowed("c");
        let names: Vec<_> = stats.sorted().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(CallStats::new().format_summary(), "No calls monitored.\n");
    }

    #[test]
    fn test_summary_contains_calls_and_total() {
        let mut stats = CallStats::new();
        stats.record_allowed("open");
        stats.record_ignored("puts");
        let summary = stats.format_summary();
        assert!(summary.contains("open"));
        assert!(summary.contains("puts"));
        assert!(summary.contains("total"));
        assert!(summary.contains(" 50.00"));
    }
}
