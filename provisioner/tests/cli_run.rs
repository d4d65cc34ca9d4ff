//! CLI tests for `provision check/plan/run/status/exec`.
//!
//! Spawns the provision binary against plans that only use portable
//! commands, and verifies exit codes and recorded state.

use std::process::{Command, Output};

use provisioner::core::lifecycle::Phase;
use provisioner::exit_codes;
use provisioner::io::run_log::StatePaths;
use provisioner::run::last_run_record;
use provisioner::test_support::TestWorkspace;

const FAILING_PLAN: &str = r#"
[plan]
name = "failing"

[[steps]]
name = "first"
action = "run"
command = ["sh", "-c", "echo first > first.txt"]

[[steps]]
name = "second"
action = "run"
command = ["sh", "-c", "echo broken >&2; exit 7"]

[[steps]]
name = "third"
action = "run"
command = ["sh", "-c", "echo third > third.txt"]
"#;

const PASSING_PLAN: &str = r#"
[plan]
name = "passing"
entrypoint = ["env"]

[[steps]]
name = "tools"
action = "prepend_path"
dir = "{{ workdir }}/bin"

[[steps]]
name = "marker"
action = "set_env"
key = "PROVISIONED"
value = "yes"

[[steps]]
name = "check-path"
action = "run"
command = ["sh", "-c", "case \"$PATH\" in \"$0\"/bin:*) exit 0;; *) exit 3;; esac", "{{ workdir }}"]
"#;

fn provision(ws: &TestWorkspace, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_provision"))
        .current_dir(ws.root())
        .arg("--state-dir")
        .arg(ws.state_dir())
        .args(args)
        .output()
        .expect("spawn provision")
}

#[test]
fn check_rejects_invalid_plan() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws
        .write_plan("[plan]\nname = \"x\"\n\n[[steps]]\nname = \"a\"\naction = \"build\"\n")
        .expect("write");
    let out = provision(&ws, &["check", "--plan", plan.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("schema validation failed"), "{stderr}");
}

#[test]
fn init_then_check_accepts_builtin_plan() {
    let ws = TestWorkspace::new().expect("workspace");
    let out = provision(&ws, &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let out = provision(&ws, &["check"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("plan analysis-platform ok"));

    let out = provision(&ws, &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn plan_prints_commands_without_running_them() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws.write_plan(FAILING_PLAN).expect("write");
    let out = provision(&ws, &["plan", "--plan", plan.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("03 third (run)"), "{stdout}");
    assert!(!ws.root().join("first.txt").exists());
}

#[test]
fn run_propagates_failing_step_status_and_skips_the_rest() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws.write_plan(FAILING_PLAN).expect("write");
    let out = provision(&ws, &["run", "--plan", plan.to_str().expect("utf8")]);

    assert_eq!(out.status.code(), Some(7));
    assert!(ws.root().join("first.txt").exists());
    assert!(!ws.root().join("third.txt").exists());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("broken"), "{stdout}");

    let state = StatePaths::new(&ws.state_dir());
    let record = last_run_record(&state).expect("load").expect("record");
    assert_eq!(record.phase, Phase::Failed);
    let log = state.run(&record.run_id).step_log_path(1, "second");
    let logged = std::fs::read_to_string(&log).expect("step log");
    assert!(logged.contains("broken"), "{logged}");

    // The base is no longer clean.
    let out = provision(&ws, &["run", "--plan", plan.to_str().expect("utf8")]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--force"));
}

#[test]
fn run_then_exec_uses_provisioned_environment() {
    let ws = TestWorkspace::new().expect("workspace");
    let plan = ws.write_plan(PASSING_PLAN).expect("write");
    let out = provision(&ws, &["run", "--plan", plan.to_str().expect("utf8")]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "{}",
        String::from_utf8_lossy(&out.stdout)
    );

    let out = provision(&ws, &["status"]);
    assert!(String::from_utf8_lossy(&out.stdout).contains("succeeded"));

    let out = provision(&ws, &["exec", "--", "sh", "-c", "test \"$PROVISIONED\" = yes || exit 9"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let out = provision(&ws, &["exec", "--", "sh", "-c", "exit 6"]);
    assert_eq!(out.status.code(), Some(6));
}
