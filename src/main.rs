use anyhow::{Context, Result};
use clap::Parser;
use libsandbox::cli::{
    BuildDbArgs, Cli, Command, ComposeArgs, DotArgs, MonitorArgs, OutputFormat, ReduceArgs,
};
use libsandbox::compose::{Composer, RecursionPolicy};
use libsandbox::config::{self, FunctionTable, SandboxConfig};
use libsandbox::database::{PolicyDatabase, ScanOptions};
use libsandbox::filter::IgnoreSet;
use libsandbox::json_output::JsonOutput;
use libsandbox::monitor::Monitor;
use libsandbox::reduce::{self, ReduceOptions};
use libsandbox::render::{self, RenderStatus};
use libsandbox::session::{self, SessionOptions, SessionOutcome};
use libsandbox::signal::InterruptFlag;
use libsandbox::tracer::{EventSource, PtraceEventSource, TracerConfig};
use libsandbox::{automaton::Automaton, policy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Write `text` to `path`, or stdout when no path is given
fn emit(text: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}

/// Policy paths in a config file are relative to the config file
fn relative_to(config_path: &Path, path: &Path) -> PathBuf {
    config_path
        .parent()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|| path.to_path_buf())
}

fn run_monitor(args: MonitorArgs) -> Result<i32> {
    let functions_path = args
        .functions
        .as_deref()
        .map(config::expand_home)
        .unwrap_or_else(config::default_functions_path);
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_path(&args.executable));

    config::require_file(&functions_path, "Function table")?;
    config::require_file(&args.executable, "Executable")?;
    config::require_file(&config_path, "Config file")?;

    let sandbox_config = SandboxConfig::load(&config_path)?;
    let policy_path = relative_to(&config_path, &sandbox_config.policy);
    config::require_file(&policy_path, "Policy file")?;
    let ignores = match &sandbox_config.ignores {
        Some(path) => {
            let path = relative_to(&config_path, path);
            config::require_file(&path, "Ignore file")?;
            IgnoreSet::load(&path)?
        }
        None => IgnoreSet::empty(),
    };

    let functions = FunctionTable::load(&functions_path)?;
    let mut policy = policy::load_policy(&policy_path)?;
    if policy.has_epsilon() {
        debug!("policy has epsilon transitions, reducing before monitoring");
        policy = reduce::reduce(&policy, ReduceOptions::default());
    }

    let tracer_config = TracerConfig {
        marker_syscall: args
            .marker_syscall
            .or(sandbox_config.marker_syscall)
            .unwrap_or(config::DEFAULT_MARKER_SYSCALL),
        channel_capacity: args
            .channel_capacity
            .or(sandbox_config.channel_capacity)
            .unwrap_or(config::DEFAULT_CHANNEL_CAPACITY),
    };
    let options = SessionOptions {
        poll_interval: Duration::from_millis(
            args.poll_interval_ms
                .or(sandbox_config.poll_interval_ms)
                .unwrap_or(config::DEFAULT_POLL_INTERVAL_MS),
        ),
    };

    let fingerprint = policy.fingerprint();
    let mut monitor = Monitor::new(policy, functions, ignores);
    let interrupt = InterruptFlag::install()?;

    let mut command = vec![args.executable.to_string_lossy().into_owned()];
    command.extend(args.args);
    let mut source = PtraceEventSource::spawn(&command, tracer_config)?;
    eprintln!(
        "[libsandbox: Monitoring process {} with policy {}]",
        source.pid(),
        policy_path.display()
    );

    let report = session::run_session(&mut monitor, &mut source, &options, &|| {
        interrupt.is_set()
    })?;

    if report.dropped_events > 0 {
        eprintln!(
            "[libsandbox: Warning - {} events dropped, enforcement was incomplete]",
            report.dropped_events
        );
    }

    match args.format {
        OutputFormat::Text => match &report.outcome {
            SessionOutcome::Completed { exit } => {
                eprintln!("[libsandbox: Process exited with status {}]", exit.code())
            }
            SessionOutcome::Violation {
                symbol,
                event_index,
                ..
            } => eprintln!(
                "[libsandbox: Process killed: call `{}` (event {}) not allowed by policy]",
                symbol, event_index
            ),
            SessionOutcome::UnresolvedCall { call_id, .. } => eprintln!(
                "[libsandbox: Process killed: call id {} missing from function table]",
                call_id
            ),
            SessionOutcome::Aborted => {}
        },
        OutputFormat::Json => {
            let mut output = JsonOutput::new(args.executable.display().to_string(), fingerprint);
            output.set_report(&report);
            output.set_calls(monitor.stats());
            match output.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Failed to serialize JSON: {}", e),
            }
        }
    }

    if args.statistics {
        monitor.stats().print_summary();
    }

    Ok(report.outcome.exit_code())
}

fn run_reduce(args: ReduceArgs) -> Result<()> {
    config::require_file(&args.policy, "Policy file")?;
    let raw = policy::load_policy(&args.policy)?;
    let reduced = reduce::reduce(
        &raw,
        ReduceOptions {
            fold_entry_closure: args.fold_entry,
        },
    );
    eprintln!(
        "[libsandbox: Reduced {} states to {}]",
        raw.state_count(),
        reduced.state_count()
    );
    emit(&policy::write_policy(&reduced), args.output.as_deref())
}

fn run_compose(args: ComposeArgs) -> Result<()> {
    config::require_file(&args.policy, "Policy file")?;
    config::require_file(&args.database, "Policy database")?;
    let program = policy::load_policy(&args.policy)?;
    let database = PolicyDatabase::load(&args.database)
        .with_context(|| format!("Failed to load database {}", args.database.display()))?;

    let recursion = if args.reject_recursion {
        RecursionPolicy::Reject
    } else {
        RecursionPolicy::Leaf
    };
    let composition = Composer::new(&database)
        .with_recursion_policy(recursion)
        .with_reduce_options(ReduceOptions {
            fold_entry_closure: args.fold_entry,
        })
        .compose(&program)?;

    for site in &composition.report.recursive_sites {
        eprintln!(
            "[libsandbox: Warning - recursive call to `{}` at state {} kept as a call edge]",
            site.function, site.state
        );
    }
    eprintln!(
        "[libsandbox: Inlined {} call sites in {} passes, {} states]",
        composition.report.inlined_sites,
        composition.report.passes,
        composition.automaton.state_count()
    );

    if let Some(dot_path) = &args.dot {
        emit(&render::to_dot(&composition.automaton), Some(dot_path))?;
    }
    emit(&policy::write_policy(&composition.automaton), args.output.as_deref())
}

fn run_build_db(args: BuildDbArgs) -> Result<()> {
    if !args.corpus.is_dir() {
        anyhow::bail!("Corpus directory not found at {}", args.corpus.display());
    }
    let options = ScanOptions {
        exclude: args.exclude,
        entry_point: args.entry_point,
    };
    let (database, report) = PolicyDatabase::scan_corpus(&args.corpus, &options)?;
    database
        .save(&args.output)
        .with_context(|| format!("Failed to save database {}", args.output.display()))?;

    eprintln!(
        "[libsandbox: {} programs, {} functions, {} variants ({} duplicates, {} rejected)]",
        report.programs,
        database.len(),
        database.variant_count(),
        report.duplicates,
        report.rejected
    );
    Ok(())
}

fn run_dot(args: DotArgs) -> Result<()> {
    config::require_file(&args.policy, "Policy file")?;
    let automaton: Automaton = policy::load_policy(&args.policy)?;
    emit(&render::to_dot(&automaton), args.output.as_deref())?;

    if let (Some(png), Some(dot_path)) = (&args.png, &args.output) {
        match render::render_png(dot_path, png, Duration::from_secs(args.timeout_secs)) {
            Ok(RenderStatus::Rendered) => {}
            Ok(RenderStatus::TimedOut) => eprintln!(
                "[libsandbox: Warning - rendering exceeded {}s, skipped]",
                args.timeout_secs
            ),
            Ok(RenderStatus::Failed(code)) => {
                eprintln!("[libsandbox: Warning - dot failed with status {:?}]", code)
            }
            Err(e) => eprintln!("[libsandbox: Warning - rendering skipped: {:#}]", e),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(cli.debug);

    match cli.command {
        Command::Monitor(args) => {
            let code = run_monitor(args)?;
            std::process::exit(code);
        }
        Command::Reduce(args) => run_reduce(args),
        Command::Compose(args) => run_compose(args),
        Command::BuildDb(args) => run_build_db(args),
        Command::Dot(args) => run_dot(args),
    }
}
