//! Ignore set: calls excluded from enforcement
//!
//! One entry per line of the ignore file:
//! - Exact call names: `printf`
//! - Regex patterns between slashes: `/^str.*/`
//!
//! Blank lines and `#` comments are skipped. An ignored call never reaches
//! the frontier; it is elided from the event stream, not accepted by every
//! state.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    names: HashSet<String>,
    patterns: Vec<Regex>,
}

impl IgnoreSet {
    /// Ignore nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            patterns: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut set = Self::empty();
        for (idx, line) in text.lines().enumerate() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            set.add_entry(entry)
                .with_context(|| format!("line {}: invalid ignore entry", idx + 1))?;
        }
        Ok(set)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ignores file {}", path.display()))?;
        Self::parse(&text)
    }

    /// Add a name or a `/regex/` pattern
    pub fn add_entry(&mut self, entry: &str) -> Result<()> {
        match entry
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if !pattern.is_empty() => {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("Invalid regex pattern /{}/", pattern))?;
                self.patterns.push(regex);
            }
            _ => {
                self.names.insert(entry.to_string());
            }
        }
        Ok(())
    }

    /// Check if a call is excluded from enforcement
    pub fn contains(&self, call: &str) -> bool {
        self.names.contains(call) || self.patterns.iter().any(|re| re.is_match(call))
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.patterns.is_empty()
    }
}
