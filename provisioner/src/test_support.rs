//! Test-only helpers: scripted command runners, base environments and step
//! builders.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::environment::Environment;
use crate::core::step::{Action, Invocation, Step};
use crate::io::runner::{CommandOutcome, CommandRequest, CommandRunner};

#[derive(Debug, Clone)]
enum Reaction {
    Exit(i32),
    TimeOut,
    SpawnError,
    Stdout(String),
    Delay(Duration),
}

/// Command runner that records every request and answers from a script.
///
/// Reactions are keyed by a prefix of the rendered logical command
/// (`Invocation` display). Unmatched commands exit 0 with no output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    reactions: Vec<(String, Reaction)>,
    requests: RefCell<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn fail_when(mut self, prefix: &str, code: i32) -> Self {
        self.reactions.push((prefix.to_string(), Reaction::Exit(code)));
        self
    }

    pub fn time_out_when(mut self, prefix: &str) -> Self {
        self.reactions.push((prefix.to_string(), Reaction::TimeOut));
        self
    }

    pub fn spawn_error_when(mut self, prefix: &str) -> Self {
        self.reactions
            .push((prefix.to_string(), Reaction::SpawnError));
        self
    }

    pub fn stdout_when(mut self, prefix: &str, stdout: &str) -> Self {
        self.reactions
            .push((prefix.to_string(), Reaction::Stdout(stdout.to_string())));
        self
    }

    /// Succeed after sleeping, to consume part of a step's time.
    pub fn delay_when(mut self, prefix: &str, delay: Duration) -> Self {
        self.reactions.push((prefix.to_string(), Reaction::Delay(delay)));
        self
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.borrow().clone()
    }

    /// Rendered logical commands in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.invocation.to_string())
            .collect()
    }

    /// True if any executed command starts with `prefix`.
    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|command| command.starts_with(prefix))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        self.requests.borrow_mut().push(request.clone());
        let display = request.invocation.to_string();
        let reaction = self
            .reactions
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
            .map(|(_, reaction)| reaction.clone());

        match reaction {
            None => Ok(CommandOutcome::success(display)),
            Some(Reaction::Exit(code)) => {
                let mut outcome = CommandOutcome::exited(display, code);
                outcome.stderr = format!("scripted failure {code}\n").into_bytes();
                Ok(outcome)
            }
            Some(Reaction::TimeOut) => Ok(CommandOutcome {
                command: display,
                exit_code: None,
                timed_out: true,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
            Some(Reaction::SpawnError) => {
                Err(anyhow!("spawn {display}: No such file or directory"))
            }
            Some(Reaction::Delay(delay)) => {
                std::thread::sleep(delay);
                Ok(CommandOutcome::success(display))
            }
            Some(Reaction::Stdout(stdout)) => {
                let mut outcome = CommandOutcome::success(display);
                outcome.stdout = stdout.into_bytes();
                Ok(outcome)
            }
        }
    }
}

/// Root-invoked base environment, as in a fresh container image.
pub fn base_env() -> Environment {
    Environment::new(
        "root",
        "/root",
        "/work",
        vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/usr/bin"),
            PathBuf::from("/bin"),
        ],
    )
}

/// `run` step executing `argv`.
pub fn run_step(name: &str, argv: &[&str]) -> Step {
    Step::new(
        name,
        Action::Run {
            command: Invocation::new(argv[0], argv[1..].iter().copied()),
        },
    )
}

/// Temporary directory holding a plan file and a state directory.
pub struct TestWorkspace {
    dir: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join(".provision")
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root().join("provision.toml")
    }

    pub fn write_plan(&self, contents: &str) -> Result<PathBuf> {
        let path = self.plan_path();
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
