//! Sandbox configuration and the call-id function table
//!
//! The configuration file names the policy (line 1) and, optionally, the
//! ignore file (line 2). A config whose name ends in `.toml` may also carry
//! event-source tuning:
//!
//! ```toml
//! policy = "prog.policy"
//! ignores = "prog.ignores"
//! marker_syscall = 548
//! channel_capacity = 4096
//! poll_interval_ms = 10
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Numeric call identifier reported by the event source
pub type CallId = u64;

/// Syscall number instrumented binaries use to report a call id
pub const DEFAULT_MARKER_SYSCALL: i64 = 548;

/// Event queue depth between the tracer thread and the monitor
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Event poll timeout of the monitor loop
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Maps call ids to call names (`name id` per line)
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    names: HashMap<CallId, String>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut names = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(id), None) = (parts.next(), parts.next(), parts.next()) else {
                bail!("line {}: expected `name id`, found `{}`", idx + 1, line);
            };
            let id: CallId = id
                .parse()
                .with_context(|| format!("line {}: invalid call id `{}`", idx + 1, id))?;
            names.insert(id, name.to_string());
        }
        Ok(Self { names })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read function table {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Malformed function table {}", path.display()))
    }

    pub fn insert(&mut self, id: CallId, name: impl Into<String>) {
        self.names.insert(id, name.into());
    }

    pub fn resolve(&self, id: CallId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, CallId)> for FunctionTable {
    fn from_iter<I: IntoIterator<Item = (S, CallId)>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(|(name, id)| (id, name.into())).collect(),
        }
    }
}

/// Parsed configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SandboxConfig {
    pub policy: PathBuf,
    #[serde(default)]
    pub ignores: Option<PathBuf>,
    #[serde(default)]
    pub marker_syscall: Option<i64>,
    #[serde(default)]
    pub channel_capacity: Option<usize>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl SandboxConfig {
    /// Parse the line-oriented format
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim);
        let policy = match lines.next() {
            Some(line) if !line.is_empty() => PathBuf::from(line),
            _ => bail!("config is empty: expected the policy path on line 1"),
        };
        let ignores = lines
            .next()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            policy,
            ignores,
            marker_syscall: None,
            channel_capacity: None,
            poll_interval_ms: None,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml_str(&text)
        } else {
            Self::parse(&text)
        };
        config.with_context(|| format!("Malformed config file {}", path.display()))
    }
}

/// `~/.libsandbox/functions.txt`
pub fn default_functions_path() -> PathBuf {
    expand_home(Path::new("~/.libsandbox/functions.txt"))
}

/// `<executable>.config`
pub fn default_config_path(executable: &Path) -> PathBuf {
    let mut path = executable.as_os_str().to_owned();
    path.push(".config");
    PathBuf::from(path)
}

/// Expand a leading `~/` from `$HOME`
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Fail before monitoring if a required file is absent
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", what, path.display());
    }
    Ok(())
}
