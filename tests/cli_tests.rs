//! CLI integration tests for the offline subcommands and setup errors
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

mod utils;

use libsandbox::database::PolicyDatabase;
use libsandbox::policy::load_policy;
use predicates::prelude::*;
use tempfile::TempDir;
use std::io::{BufRead, BufReader};
use std::process::Stdio;
use std::time::Duration;
use utils::{compile_c, marker_program, process_state, write_file};

#[test]
fn test_reduce_writes_epsilon_free_policy() {
    let dir = TempDir::new().unwrap();
    let input = write_file(dir.path(), "raw.policy", "0\n0 0 1\n1 open 2\n2 read 2\n");
    let output = dir.path().join("reduced.policy");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("reduce")
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .assert()
        .success()
        .stderr(predicate::str::contains("[libsandbox: Reduced"));

    let reduced = load_policy(&output).unwrap();
    assert!(!reduced.has_epsilon());
}

#[test]
fn test_reduce_to_stdout() {
    let dir = TempDir::new().unwrap();
    let input = write_file(dir.path(), "raw.policy", "0\n0 open 1\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("reduce")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("0\n"))
        .stdout(predicate::str::contains("0 open 1"));
}

#[test]
fn test_malformed_policy_reports_line() {
    let dir = TempDir::new().unwrap();
    let input = write_file(dir.path(), "bad.policy", "0\n0 open\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("reduce")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn test_build_db_then_compose() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write_file(root, "corpus/app/app.policy", "0\n0 load 1\n1 close 2\n");
    write_file(root, "corpus/app/app_load.fpolicy", "3\n5\n3 open 4\n4 read 5\n");
    write_file(root, "corpus/app/app_main.fpolicy", "0\n1\n0 load 1\n");
    let db_path = root.join("functions.db");

    let mut build = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    build
        .arg("build-db")
        .arg(root.join("corpus"))
        .arg("-o")
        .arg(&db_path)
        .assert()
        .success()
        .stderr(predicate::str::contains("1 functions"));

    let db = PolicyDatabase::load(&db_path).unwrap();
    assert!(db.contains("load"));
    assert!(!db.contains("main"));

    let composed = root.join("app.composed.policy");
    let dot = root.join("app.dot");
    let mut compose = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    compose
        .arg("compose")
        .arg(root.join("corpus/app/app.policy"))
        .arg("--database")
        .arg(&db_path)
        .arg("-o")
        .arg(&composed)
        .arg("--dot")
        .arg(&dot)
        .assert()
        .success()
        .stderr(predicate::str::contains("Inlined 1 call sites"));

    let text = std::fs::read_to_string(&composed).unwrap();
    assert!(text.contains(" open "));
    assert!(!text.contains(" load "));
    assert!(std::fs::read_to_string(&dot).unwrap().starts_with("digraph NFA"));
}

#[test]
fn test_compose_reject_recursion_fails() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write_file(root, "corpus/p.policy", "0\n0 walk 1\n");
    write_file(root, "corpus/p_walk.fpolicy", "0\n1\n0 walk 1\n");
    let db_path = root.join("functions.json");

    let mut build = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    build
        .arg("build-db")
        .arg(root.join("corpus"))
        .arg("-o")
        .arg(&db_path)
        .assert()
        .success();

    let mut compose = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    compose
        .arg("compose")
        .arg(root.join("corpus/p.policy"))
        .arg("--database")
        .arg(&db_path)
        .arg("--reject-recursion")
        .assert()
        .failure()
        .stderr(predicate::str::contains("recursive inlining"));

    let mut leaf = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    leaf.arg("compose")
        .arg(root.join("corpus/p.policy"))
        .arg("--database")
        .arg(&db_path)
        .assert()
        .success()
        .stderr(predicate::str::contains("recursive call to `walk`"));
}

#[test]
fn test_dot_to_stdout() {
    let dir = TempDir::new().unwrap();
    let input = write_file(dir.path(), "p.policy", "0\n0 open 1\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("dot")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entry point\" -> \"0\""))
        .stdout(predicate::str::contains("[label=\"open\"]"));
}

#[test]
fn test_monitor_missing_function_table() {
    let dir = TempDir::new().unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("monitor")
        .arg("--functions")
        .arg(dir.path().join("nope.txt"))
        .arg("/bin/true")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Function table not found"));
}

#[test]
fn test_monitor_missing_config() {
    let dir = TempDir::new().unwrap();
    let functions = write_file(dir.path(), "functions.txt", "open 1\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("monitor")
        .arg("--functions")
        .arg(&functions)
        .arg("--config")
        .arg(dir.path().join("missing.config"))
        .arg("/bin/true")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_monitor_missing_policy_named_by_config() {
    let dir = TempDir::new().unwrap();
    let functions = write_file(dir.path(), "functions.txt", "open 1\n");
    let config = write_file(dir.path(), "app.config", "absent.policy\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("monitor")
        .arg("--functions")
        .arg(&functions)
        .arg("--config")
        .arg(&config)
        .arg("/bin/true")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Policy file not found"));
}

#[test]
fn test_monitor_missing_executable() {
    let dir = TempDir::new().unwrap();
    let functions = write_file(dir.path(), "functions.txt", "open 1\n");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("monitor")
        .arg("--functions")
        .arg(&functions)
        .arg(dir.path().join("no-such-binary"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Executable not found"));
}

#[test]
fn test_monitor_exits_with_violation_status() {
    let dir = TempDir::new().unwrap();
    let functions = write_file(dir.path(), "functions.txt", "open 1\nread 2\n");
    write_file(dir.path(), "app.policy", "0\n0 open 1\n");
    let config = write_file(dir.path(), "app.config", "app.policy\n");
    let program = compile_c(dir.path(), "app", &marker_program(&[1, 2], 30));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("libsandbox");
    cmd.arg("monitor")
        .arg("--functions")
        .arg(&functions)
        .arg("--config")
        .arg(&config)
        .arg(&program)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Policy violation on call `read`"));
}

#[test]
fn test_monitor_interrupt_leaves_process_running() {
    let dir = TempDir::new().unwrap();
    let functions = write_file(dir.path(), "functions.txt", "open 1\n");
    write_file(dir.path(), "sleep.policy", "0\n0 open 1\n");
    let config = write_file(dir.path(), "sleep.config", "sleep.policy\n");

    let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_libsandbox"))
        .arg("monitor")
        .arg("--functions")
        .arg(&functions)
        .arg("--config")
        .arg(&config)
        .arg("/bin/sleep")
        .arg("30")
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut stderr = BufReader::new(child.stderr.take().unwrap());
    let mut line = String::new();
    stderr.read_line(&mut line).unwrap();
    let traced: u32 = line
        .strip_prefix("[libsandbox: Monitoring process ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|pid| pid.parse().ok())
        .unwrap_or_else(|| panic!("unexpected status line: {}", line));

    std::thread::sleep(Duration::from_millis(200));
    let monitor = nix::unistd::Pid::from_raw(child.id() as i32);
    nix::sys::signal::kill(monitor, nix::sys::signal::Signal::SIGINT).unwrap();
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(130));

    std::thread::sleep(Duration::from_millis(200));
    let state = process_state(traced);
    let target = nix::unistd::Pid::from_raw(traced as i32);
    let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGKILL);
    assert_eq!(state, Some('S'), "sleep should outlive the monitor");
}
