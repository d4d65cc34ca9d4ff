//! Command runner abstraction.
//!
//! The [`CommandRunner`] trait decouples provisioning from real process
//! execution. Requests carry the logical invocation plus the environment and
//! privilege it must run under; [`ShellRunner`] turns that into an actual
//! `sudo`/`env` launch, while tests use scripted runners that record requests
//! without spawning anything.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::core::environment::Environment;
use crate::core::privilege::launch_for;
use crate::core::step::{Invocation, Privilege};
use crate::io::process::run_command;

/// Parameters for one external command.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub invocation: Invocation,
    /// Environment (identity, search path, variables) to run under.
    pub env: Environment,
    pub privilege: Privilege,
    pub workdir: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Step log the command's output is appended to.
    pub log_path: Option<PathBuf>,
}

/// Result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Rendered logical command (before privilege wrapping).
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutcome {
    /// A successful outcome with no output (used by dry runs and fakes).
    pub fn success(command: impl Into<String>) -> Self {
        Self::exited(command, 0)
    }

    pub fn exited(command: impl Into<String>, code: i32) -> Self {
        Self {
            command: command.into(),
            exit_code: Some(code),
            timed_out: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn succeeded(&self, expected: i32) -> bool {
        !self.timed_out && self.exit_code == Some(expected)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last `limit` bytes of stderr (or stdout when stderr is empty).
    pub fn tail(&self, limit: usize) -> String {
        let source = if self.stderr.iter().all(u8::is_ascii_whitespace) {
            &self.stdout
        } else {
            &self.stderr
        };
        let mut start = source.len().saturating_sub(limit);
        while start < source.len() && (source[start] & 0xC0) == 0x80 {
            start += 1;
        }
        String::from_utf8_lossy(&source[start..]).trim().to_string()
    }
}

/// Abstraction over command execution backends.
pub trait CommandRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        (**self).run(request)
    }
}

/// Runner that spawns real processes.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    sudo_program: String,
}

impl ShellRunner {
    pub fn new(sudo_program: impl Into<String>) -> Self {
        Self {
            sudo_program: sudo_program.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sudo")
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(user = %request.env.user, privilege = ?request.privilege))]
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        let shown = request.invocation.to_string();
        let launch = launch_for(
            &request.invocation,
            &request.env,
            request.privilege,
            &self.sudo_program,
        );
        info!(command = %shown, workdir = %request.workdir.display(), "running command");

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .env_clear()
            .envs(&launch.env)
            .current_dir(&request.workdir);

        let output = run_command(
            cmd,
            &shown,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
            request.log_path.as_deref(),
        )?;
        debug!(exit_code = ?output.exit_code, timed_out = output.timed_out, "command outcome");

        Ok(CommandOutcome {
            command: shown,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Runner that records what would run and reports success.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    lines: RefCell<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the recorded lines.
    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        let shown = request.invocation.to_string();
        let mut line = String::new();
        if request.env.is_switched() {
            line.push_str(&format!("[{}] ", request.env.user));
        }
        if request.privilege == Privilege::Elevated {
            line.push_str("(elevated) ");
        }
        line.push_str(&shown);
        if request.stdin.is_some() {
            line.push_str(" <<< stdin");
        }
        self.lines.borrow_mut().push(line);
        Ok(CommandOutcome::success(shown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(invocation: Invocation) -> CommandRequest {
        CommandRequest {
            invocation,
            env: Environment::new("root", "/root", "/", vec![PathBuf::from("/usr/bin")]),
            privilege: Privilege::Normal,
            workdir: PathBuf::from("/"),
            stdin: None,
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1000,
            log_path: None,
        }
    }

    #[test]
    fn tail_prefers_stderr() {
        let mut outcome = CommandOutcome::exited("x", 1);
        outcome.stdout = b"stdout text".to_vec();
        assert_eq!(outcome.tail(100), "stdout text");
        outcome.stderr = b"E: Unable to locate package nope\n".to_vec();
        assert_eq!(outcome.tail(11), "ckage nope");
    }

    #[test]
    fn tail_starts_on_a_char_boundary() {
        let mut outcome = CommandOutcome::exited("x", 1);
        outcome.stderr = "échec: données".as_bytes().to_vec();
        // Three bytes back lands inside the two-byte 'é'.
        assert_eq!(outcome.tail(3), "es");
        assert_eq!(outcome.tail(4), "ées");
    }

    #[test]
    fn succeeded_respects_expected_and_timeout() {
        let mut outcome = CommandOutcome::exited("x", 2);
        assert!(outcome.succeeded(2));
        assert!(!outcome.succeeded(0));
        outcome.timed_out = true;
        assert!(!outcome.succeeded(2));
    }

    #[test]
    fn dry_run_records_identity_and_privilege() {
        let runner = DryRunRunner::new();
        let mut req = request(Invocation::new("apt-get", ["update"]));
        req.privilege = Privilege::Elevated;
        runner.run(&req).expect("dry run");
        assert_eq!(runner.take_lines(), vec!["(elevated) apt-get update"]);
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_exports_threaded_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(Invocation::new("sh", ["-c", "echo $PATH; exit 4"]));
        req.env.search_path = vec![
            PathBuf::from("/opt/tool/bin"),
            PathBuf::from("/usr/bin"),
            PathBuf::from("/bin"),
        ];
        req.workdir = temp.path().to_path_buf();
        req.env.invoking_user = "tester".to_string();
        req.env.user = "tester".to_string();

        let outcome = ShellRunner::default().run(&req).expect("run");
        assert_eq!(outcome.exit_code, Some(4));
        assert_eq!(outcome.stdout_text().trim(), "/opt/tool/bin:/usr/bin:/bin");
    }
}
