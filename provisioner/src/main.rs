//! Sequential environment provisioner.
//!
//! Executes a TOML plan of provisioning steps (packages, installers,
//! repositories, sources, builds, accounts) in order, stopping at the first
//! failure. State lives under `.provision/` by default.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use provisioner::exec::exec_command;
use provisioner::exit_codes;
use provisioner::io::host::detect_environment;
use provisioner::io::plan::load_plan;
use provisioner::io::run_log::StatePaths;
use provisioner::io::runner::ShellRunner;
use provisioner::logging;
use provisioner::provisioner::StepReport;
use provisioner::run::{
    check_plan, dry_run_plan, format_summary, init_state, last_run_record, load_state_config,
    run_plan,
};

#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Sequential provisioner for binary-analysis environments"
)]
struct Cli {
    /// State directory holding config, the default plan and run records.
    #[arg(long, global = true, default_value = ".provision")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config and the built-in analysis-platform plan.
    Init {
        /// Overwrite an existing plan and config.
        #[arg(short, long)]
        force: bool,
        /// Where to write the plan (default: `<state-dir>/plan.toml`).
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Validate a plan against the schema and plan invariants.
    Check {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Print the commands each step would run without executing anything.
    Plan {
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// Execute a plan, stopping at the first failing step.
    Run {
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Run even if a previous run is recorded in the state directory.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a command inside the environment of the last successful run.
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Summarize the last run.
    Status,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let state = StatePaths::new(&cli.state_dir);
    match cli.command {
        Command::Init { force, plan } => cmd_init(&state, plan.as_deref(), force),
        Command::Check { plan } => cmd_check(&state, plan.as_deref()),
        Command::Plan { plan } => cmd_plan(&state, plan.as_deref()),
        Command::Run { plan, force } => cmd_run(&state, plan.as_deref(), force),
        Command::Exec { command } => cmd_exec(&state, &command),
        Command::Status => cmd_status(&state),
    }
}

fn plan_path(state: &StatePaths, plan: Option<&Path>) -> PathBuf {
    plan.map(Path::to_path_buf)
        .unwrap_or_else(|| state.plan_path.clone())
}

fn cmd_init(state: &StatePaths, plan: Option<&Path>, force: bool) -> Result<i32> {
    let path = plan_path(state, plan);
    init_state(state, &path, force)?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(state: &StatePaths, plan: Option<&Path>) -> Result<i32> {
    let base = detect_environment()?;
    let plan = check_plan(&plan_path(state, plan), &base)?;
    println!(
        "plan {} ok: {} steps (sha256 {})",
        plan.name(),
        plan.steps().len(),
        plan.digest
    );
    Ok(exit_codes::OK)
}

fn cmd_plan(state: &StatePaths, plan: Option<&Path>) -> Result<i32> {
    let cfg = load_state_config(state)?;
    let base = detect_environment()?;
    let plan = load_plan(&plan_path(state, plan))?;
    for line in dry_run_plan(&plan, &base, &cfg)? {
        println!("{line}");
    }
    Ok(exit_codes::OK)
}

fn cmd_run(state: &StatePaths, plan: Option<&Path>, force: bool) -> Result<i32> {
    let cfg = load_state_config(state)?;
    let base = detect_environment()?;
    let plan = load_plan(&plan_path(state, plan))?;
    let total = plan.steps().len();
    let progress = |report: &StepReport| {
        eprintln!(
            "[{:02}/{total:02}] {} ({}): {:?}",
            report.index + 1,
            report.name,
            report.action,
            report.phase
        );
    };

    let runner = ShellRunner::new(cfg.sudo.program.clone());
    let record = run_plan(state, &plan, &base, &cfg, runner, force, &progress)?;
    print!("{}", format_summary(&record));
    Ok(record
        .failure
        .as_ref()
        .map(exit_codes::for_failure)
        .unwrap_or(exit_codes::OK))
}

fn cmd_exec(state: &StatePaths, command: &[String]) -> Result<i32> {
    let cfg = load_state_config(state)?;
    exec_command(state, command, &cfg.sudo.program)
}

fn cmd_status(state: &StatePaths) -> Result<i32> {
    match last_run_record(state)? {
        Some(record) => {
            print!("{}", format_summary(&record));
            Ok(exit_codes::OK)
        }
        None => {
            println!("no runs recorded in {}", state.root.display());
            Ok(exit_codes::OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_plan_and_force() {
        let cli = Cli::parse_from([
            "provision",
            "--state-dir",
            "/tmp/s",
            "run",
            "--plan",
            "p.toml",
            "-f",
        ]);
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/s"));
        assert!(matches!(
            cli.command,
            Command::Run { force: true, plan: Some(ref p) } if p == Path::new("p.toml")
        ));
    }

    #[test]
    fn parse_exec_keeps_hyphenated_arguments() {
        let cli = Cli::parse_from(["provision", "exec", "--", "bap", "--list-plugins"]);
        match cli.command {
            Command::Exec { command } => assert_eq!(command, vec!["bap", "--list-plugins"]),
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn state_dir_defaults_and_is_global() {
        let cli = Cli::parse_from(["provision", "status"]);
        assert_eq!(cli.state_dir, PathBuf::from(".provision"));
        let cli = Cli::parse_from(["provision", "check", "--state-dir", "x"]);
        assert_eq!(cli.state_dir, PathBuf::from("x"));
        assert!(matches!(cli.command, Command::Check { plan: None }));
    }
}
