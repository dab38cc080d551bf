//! Function-policy database
//!
//! Maps each function name to the distinct automaton variants observed for
//! it across an analyzed corpus. Every variant is permitted: a function may
//! legally exhibit several call patterns depending on control flow.
//!
//! Variants are stored zero-based (each state minus the variant's own start
//! state), which makes structurally identical variants compare equal.

use crate::automaton::{Automaton, State};
use crate::policy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Entry point skipped when building the database
pub const ENTRY_POINT: &str = "main";

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("state `{state}` is not numeric and cannot be relabeled")]
    NonNumericState { state: String },

    #[error("state `{state}` is out of range after subtracting start `{start}`")]
    StateOutOfRange { state: String, start: String },

    #[error("function policy has no final state")]
    MissingFinal,

    #[error("failed to encode database: {0}")]
    Encode(String),

    #[error("failed to decode database: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDatabase {
    functions: BTreeMap<String, Vec<Automaton>>,
}

impl PolicyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variant unless a structurally identical one is present
    ///
    /// Returns `true` when the variant was appended.
    pub fn insert(&mut self, function: impl Into<String>, variant: Automaton) -> bool {
        let variants = self.functions.entry(function.into()).or_default();
        if variants.contains(&variant) {
            return false;
        }
        variants.push(variant);
        true
    }

    /// Normalize a raw function policy and insert it
    pub fn insert_raw(
        &mut self,
        function: impl Into<String>,
        raw: &Automaton,
    ) -> Result<bool, DatabaseError> {
        let normalized = normalize(raw)?;
        Ok(self.insert(function, normalized))
    }

    pub fn variants(&self, function: &str) -> &[Automaton] {
        self.functions
            .get(function)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Number of functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn variant_count(&self) -> usize {
        self.functions.values().map(Vec::len).sum()
    }

    /// Persist as MessagePack, or JSON when the extension is `.json`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DatabaseError> {
        let path = path.as_ref();
        let bytes = if is_json(path) {
            serde_json::to_vec_pretty(self).map_err(|e| DatabaseError::Encode(e.to_string()))?
        } else {
            rmp_serde::to_vec_named(self).map_err(|e| DatabaseError::Encode(e.to_string()))?
        };
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        if is_json(path) {
            serde_json::from_slice(&bytes).map_err(|e| DatabaseError::Decode(e.to_string()))
        } else {
            rmp_serde::from_slice(&bytes).map_err(|e| DatabaseError::Decode(e.to_string()))
        }
    }

    /// Build a database from a corpus of extracted policies
    ///
    /// A program policy `X.policy` owns the function policies named
    /// `X_<function>.fpolicy` in the same directory. When several programs
    /// match one function file, the longest program name wins.
    pub fn scan_corpus(root: &Path, options: &ScanOptions) -> anyhow::Result<(Self, ScanReport)> {
        let mut programs: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        let mut function_files: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("Failed to walk corpus {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if options.exclude.iter().any(|ex| relative.starts_with(ex)) {
                continue;
            }
            let (Some(dir), Some(stem), Some(ext)) = (
                path.parent(),
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|e| e.to_str()),
            ) else {
                continue;
            };
            match ext {
                "policy" => programs
                    .entry(dir.to_path_buf())
                    .or_default()
                    .push(stem.to_string()),
                "fpolicy" => function_files.push(path.to_path_buf()),
                _ => {}
            }
        }

        let mut db = Self::new();
        let mut report = ScanReport {
            programs: programs.values().map(Vec::len).sum(),
            ..ScanReport::default()
        };

        for file in &function_files {
            let (Some(dir), Some(stem)) = (
                file.parent(),
                file.file_stem().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            let Some(function) = programs
                .get(dir)
                .and_then(|names| owning_function(names, stem))
            else {
                debug!(file = %file.display(), "function policy without a program policy");
                report.orphaned += 1;
                continue;
            };
            if function == options.entry_point {
                report.skipped_entry_points += 1;
                continue;
            }

            let raw = match policy::load_function_policy(file) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        file = %file.display(),
                        error = %format!("{:#}", e),
                        "skipping unreadable function policy"
                    );
                    report.rejected += 1;
                    continue;
                }
            };
            match db.insert_raw(function, &raw) {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "skipping function policy");
                    report.rejected += 1;
                }
            }
        }

        info!(
            functions = db.len(),
            variants = db.variant_count(),
            duplicates = report.duplicates,
            "built policy database"
        );
        Ok((db, report))
    }
}

/// Corpus scan settings
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Directories (relative to the corpus root) to skip
    pub exclude: Vec<PathBuf>,
    /// Function name never inserted
    pub entry_point: String,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            entry_point: ENTRY_POINT.to_string(),
        }
    }
}

/// Counters from a corpus scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub programs: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped_entry_points: usize,
    pub orphaned: usize,
    pub rejected: usize,
}

/// Relabel a function policy so its start state is `0`
pub fn normalize(raw: &Automaton) -> Result<Automaton, DatabaseError> {
    if raw.final_state().is_none() {
        return Err(DatabaseError::MissingFinal);
    }
    let offset = numeric(raw.start())?;
    let mut relabel = BTreeMap::new();
    for state in raw.all_states() {
        let shifted = numeric(state)?.checked_sub(offset).ok_or_else(|| {
            DatabaseError::StateOutOfRange {
                state: state.to_string(),
                start: raw.start().to_string(),
            }
        })?;
        relabel.insert(state.clone(), State::new(shifted.to_string()));
    }
    Ok(raw.relabeled(|state| relabel.get(state).cloned().unwrap_or_else(|| state.clone())))
}

fn numeric(state: &State) -> Result<i64, DatabaseError> {
    state
        .as_str()
        .parse()
        .map_err(|_| DatabaseError::NonNumericState {
            state: state.to_string(),
        })
}

/// Function named by `stem` for the longest program in `programs` owning it
fn owning_function<'a>(programs: &[String], stem: &'a str) -> Option<&'a str> {
    programs
        .iter()
        .filter_map(|program| {
            stem.strip_prefix(program.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
                .filter(|function| !function.is_empty())
                .map(|function| (program.len(), function))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, function)| function)
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
