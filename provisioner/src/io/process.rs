//! Helpers for running child processes with timeouts and bounded output.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Time a timed-out process group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout, capturing stdout/stderr and optionally appending both
/// streams to a log file as lines arrive.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the
/// pipe). The log file, when given, receives a `$ <command_line>` header and the full output.
///
/// The child leads its own process group. On timeout the whole group is signalled, so
/// grandchildren (a `sudo` hop, a shell pipeline) cannot keep the output pipes open.
#[instrument(
    skip_all,
    fields(
        command = command_line,
        timeout_secs = timeout.as_secs(),
        logging = log_path.is_some()
    )
)]
pub fn run_command(
    mut cmd: Command,
    command_line: &str,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: Option<&Path>,
) -> Result<ProcessOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let log: SharedLog = Arc::new(open_log(log_path, command_line)?);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            append_line(&log, &format!("[spawn failed: {e}]\n"));
            return Err(e).with_context(|| format!("spawn {command_line}"));
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_log = log.clone();
    let stderr_log = log.clone();
    let stdout_handle =
        thread::spawn(move || read_stream_limited_with_tee(stdout, output_limit_bytes, stdout_log));
    let stderr_handle =
        thread::spawn(move || read_stream_limited_with_tee(stderr, output_limit_bytes, stderr_log));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            terminate_group(&mut child)?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    if timed_out {
        append_line(&log, &format!("[timed out after {}s]\n", timeout.as_secs()));
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Stop a timed-out child and everything in its process group.
///
/// SIGTERM first: `sudo` relays it to the command it runs, SIGKILL it cannot.
/// Whatever is left after [`KILL_GRACE`] is killed.
#[cfg(unix)]
fn terminate_group(child: &mut Child) -> Result<ExitStatus> {
    let group = Pid::from_raw(child.id() as i32);
    if let Err(errno) = killpg(group, Signal::SIGTERM) {
        debug!(%errno, "SIGTERM to process group failed");
    }
    let exited = child
        .wait_timeout(KILL_GRACE)
        .context("wait for command after SIGTERM")?;
    if let Err(errno) = killpg(group, Signal::SIGKILL) {
        debug!(%errno, "SIGKILL to process group failed");
    }
    match exited {
        Some(status) => Ok(status),
        None => {
            if let Err(e) = child.kill() {
                warn!(err = %e, "kill command");
            }
            child.wait().context("wait command after kill")
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(child: &mut Child) -> Result<ExitStatus> {
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

/// Run a command attached to the caller's terminal and return its exit code.
#[instrument(skip_all, fields(command = command_line))]
pub fn run_inherited(mut cmd: Command, command_line: &str) -> Result<Option<i32>> {
    debug!("spawning attached child process");
    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("spawn {command_line}"))?;
    debug!(exit_code = ?status.code(), "attached command finished");
    Ok(status.code())
}

fn open_log(path: Option<&Path>, command_line: &str) -> Result<Option<Mutex<BufWriter<File>>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "$ {command_line}").with_context(|| format!("write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(Some(Mutex::new(writer)))
}

fn append_line(log: &SharedLog, line: &str) {
    if let Some(mutex) = log.as_ref()
        && let Ok(mut writer) = mutex.lock()
    {
        if let Err(e) = writer.write_all(line.as_bytes()) {
            warn!(err = %e, "failed to write to log file");
        } else if let Err(e) = writer.flush() {
            warn!(err = %e, "failed to flush log file");
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing every line to the log.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    log: SharedLog,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = log.as_ref()
            && let Ok(mut writer) = mutex.lock()
        {
            // Write and flush immediately for real-time visibility
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to log file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush log file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_exit_code_and_output() {
        let out = run_command(
            sh("echo out; echo err >&2; exit 3"),
            "sh -c ...",
            None,
            Duration::from_secs(10),
            1000,
            None,
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "err\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command(
            Command::new("cat"),
            "cat",
            Some(b"payload\n"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, b"payload\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(
            sh("sleep 5"),
            "sleep 5",
            None,
            Duration::from_millis(200),
            1000,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = std::time::Instant::now();
        let out = run_command(
            sh("sleep 6; true"),
            "sleep 6; true",
            None,
            Duration::from_millis(200),
            1000,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "returned after {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn truncates_memory_but_logs_everything() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/step.log");
        let out = run_command(
            sh("echo 0123456789"),
            "echo",
            None,
            Duration::from_secs(10),
            4,
            Some(&log),
        )
        .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 7);

        let logged = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(logged, "$ echo\n0123456789\n");
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command(
            Command::new("/nonexistent/definitely-not-here"),
            "missing",
            None,
            Duration::from_secs(1),
            10,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn missing"));
    }
}
