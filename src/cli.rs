//! CLI argument parsing for libsandbox

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for the enforcement report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable status lines (default)
    Text,
    /// JSON report on stdout
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "libsandbox")]
#[command(version)]
#[command(about = "Library-call sandbox enforcing automaton policies", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an instrumented executable under its policy
    Monitor(MonitorArgs),
    /// Eliminate epsilon transitions and prune a raw policy
    Reduce(ReduceArgs),
    /// Inline function policies into a program policy
    Compose(ComposeArgs),
    /// Build a function-policy database from a corpus directory
    BuildDb(BuildDbArgs),
    /// Emit Graphviz DOT for a policy
    Dot(DotArgs),
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Function table (`name id` per line)
    #[arg(long = "functions", value_name = "PATH")]
    pub functions: Option<PathBuf>,

    /// Configuration file (default: <executable>.config)
    ///
    /// Relative policy and ignore paths inside it are resolved against the
    /// config file's directory, not the working directory.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Syscall number instrumented binaries use to report calls
    #[arg(long = "marker-syscall", value_name = "NR")]
    pub marker_syscall: Option<i64>,

    /// Event queue depth
    #[arg(long = "channel-capacity", value_name = "N")]
    pub channel_capacity: Option<usize>,

    /// Event poll timeout in milliseconds
    #[arg(long = "poll-interval-ms", value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Show per-call statistics summary after the run
    #[arg(short = 'c', long = "summary")]
    pub statistics: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Executable to monitor
    #[arg(value_name = "EXECUTABLE")]
    pub executable: PathBuf,

    /// Arguments passed to the executable
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ReduceArgs {
    /// Raw policy file
    pub policy: PathBuf,

    /// Output file (default: stdout)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Merge epsilon-equivalent entry states into the start state
    #[arg(long = "fold-entry")]
    pub fold_entry: bool,
}

#[derive(Args, Debug)]
pub struct ComposeArgs {
    /// Program policy file
    pub policy: PathBuf,

    /// Function-policy database
    #[arg(long = "database", value_name = "PATH")]
    pub database: PathBuf,

    /// Output file (default: stdout)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Fail on recursive inlining instead of keeping the call edge
    #[arg(long = "reject-recursion")]
    pub reject_recursion: bool,

    /// Merge epsilon-equivalent entry states into the start state
    #[arg(long = "fold-entry")]
    pub fold_entry: bool,

    /// Also write the composed policy as DOT
    #[arg(long = "dot", value_name = "PATH")]
    pub dot: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BuildDbArgs {
    /// Corpus directory holding `.policy` and `.fpolicy` files
    pub corpus: PathBuf,

    /// Database file (`.json` for JSON, MessagePack otherwise)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: PathBuf,

    /// Directory under the corpus to skip (repeatable)
    #[arg(long = "exclude", value_name = "DIR")]
    pub exclude: Vec<PathBuf>,

    /// Function never inserted into the database
    #[arg(long = "entry-point", value_name = "NAME", default_value = "main")]
    pub entry_point: String,
}

#[derive(Args, Debug)]
pub struct DotArgs {
    /// Policy file
    pub policy: PathBuf,

    /// DOT output file (default: stdout)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Render a PNG with Graphviz (requires -o)
    #[arg(long = "png", value_name = "PATH", requires = "output")]
    pub png: Option<PathBuf>,

    /// Renderer deadline in seconds
    #[arg(long = "timeout-secs", value_name = "SECS", default_value = "15")]
    pub timeout_secs: u64,
}
