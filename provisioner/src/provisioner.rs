//! Sequential step execution over a threaded [`Environment`].
//!
//! Each step is rendered against the current environment, dispatched to the
//! matching capability and judged on its exit status. The first failure ends
//! the run; later steps stay pending and nothing is undone.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use crate::core::environment::{Environment, SudoGrant, default_home};
use crate::core::failure::{FailureCause, StepFailure};
use crate::core::lifecycle::{Lifecycle, Phase};
use crate::core::step::{Action, Invocation, Step};
use crate::core::template::Renderer;
use crate::io::config::ProvisionConfig;
use crate::io::run_log::step_log_path;
use crate::io::runner::CommandOutcome;
use crate::io::tools::{StepContext, Toolbox, cleanup};

/// Timeouts and output bounds applied to every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub step_timeout: Duration,
    pub run_timeout: Duration,
    pub output_limit_bytes: usize,
    pub failure_tail_bytes: usize,
}

impl From<&ProvisionConfig> for Limits {
    fn from(cfg: &ProvisionConfig) -> Self {
        Self {
            step_timeout: cfg.step_timeout(),
            run_timeout: cfg.run_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            failure_tail_bytes: cfg.failure_tail_bytes,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&ProvisionConfig::default())
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub index: usize,
    pub name: String,
    pub action: &'static str,
    pub phase: Phase,
    /// Last command the step ran.
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Option<Duration>,
}

/// Full account of a run: per-step reports, final phases and the result.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub lifecycle: Lifecycle,
    pub duration: Duration,
    pub result: Result<Environment, StepFailure>,
}

#[derive(Debug, Default)]
struct StepDone {
    command: Option<String>,
    exit_code: Option<i32>,
}

pub struct Provisioner<'a> {
    tools: Toolbox<'a>,
    limits: Limits,
    renderer: Renderer,
    log_dir: Option<PathBuf>,
    progress: Option<&'a dyn Fn(&StepReport)>,
}

impl<'a> Provisioner<'a> {
    pub fn new(tools: Toolbox<'a>, limits: Limits) -> Self {
        Self {
            tools,
            limits,
            renderer: Renderer::new(),
            log_dir: None,
            progress: None,
        }
    }

    /// Call `progress` with each step's report as soon as the step ends.
    pub fn with_progress(mut self, progress: &'a dyn Fn(&StepReport)) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stream every command's output into `<dir>/NN-<name>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Execute `steps` in order, returning the final environment or the
    /// first failure.
    pub fn run(&self, steps: &[Step], base: &Environment) -> Result<Environment, StepFailure> {
        self.execute(steps, base).result
    }

    /// Like [`run`](Self::run), but keeps the per-step reports and phases.
    #[instrument(skip_all, fields(steps = steps.len(), user = %base.user))]
    pub fn execute(&self, steps: &[Step], base: &Environment) -> RunReport {
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(steps.len());
        track(lifecycle.start_run());

        let mut reports: Vec<StepReport> = steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepReport {
                index,
                name: step.name.clone(),
                action: step.action.label(),
                phase: Phase::Pending,
                command: None,
                exit_code: None,
                timed_out: false,
                duration: None,
            })
            .collect();

        let mut env = base.clone();
        for (index, step) in steps.iter().enumerate() {
            track(lifecycle.start_step(index));
            info!(
                index = index + 1,
                step = %step.name,
                action = step.action.label(),
                "starting step"
            );
            let step_started = Instant::now();
            let result = self.execute_step(index, step, &mut env, started);
            let report = &mut reports[index];
            report.duration = Some(step_started.elapsed());

            match result {
                Ok(done) => {
                    track(lifecycle.finish_step(index, true));
                    report.phase = Phase::Succeeded;
                    report.command = done.command;
                    report.exit_code = done.exit_code;
                    self.notify(report);
                }
                Err(failure) => {
                    track(lifecycle.finish_step(index, false));
                    report.phase = Phase::Failed;
                    report.command = failure.command.clone();
                    report.exit_code = failure.exit_status;
                    report.timed_out = failure.timed_out();
                    self.notify(report);
                    error!(%failure, "step failed; stopping run");
                    return RunReport {
                        steps: reports,
                        lifecycle,
                        duration: started.elapsed(),
                        result: Err(failure),
                    };
                }
            }
        }

        track(lifecycle.finish_run());
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "all steps succeeded");
        RunReport {
            steps: reports,
            lifecycle,
            duration: started.elapsed(),
            result: Ok(env),
        }
    }

    fn notify(&self, report: &StepReport) {
        if let Some(progress) = self.progress {
            progress(report);
        }
    }

    fn execute_step(
        &self,
        index: usize,
        step: &Step,
        env: &mut Environment,
        run_started: Instant,
    ) -> Result<StepDone, StepFailure> {
        let kind = step.action.failure_kind();
        let rendered = self
            .renderer
            .render_step(step, env)
            .map_err(|err| StepFailure::rejected(index, &step.name, kind, format!("{err:#}")))?;

        if rendered.action.is_environment_only() {
            env.apply(&rendered.action)
                .map_err(|reason| StepFailure::rejected(index, &step.name, kind, reason))?;
            return Ok(StepDone::default());
        }

        let timeout = self.step_timeout(index, &rendered, run_started)?;
        let workdir = rendered
            .workdir
            .as_deref()
            .map(|dir| env.resolve(dir))
            .unwrap_or_else(|| env.workdir.clone());
        let log_path = self
            .log_dir
            .as_deref()
            .map(|dir| step_log_path(dir, index, &step.name));
        let done = {
            let ctx = StepContext {
                env: &*env,
                privilege: rendered.privilege,
                workdir,
                deadline: Instant::now() + timeout,
                output_limit_bytes: self.limits.output_limit_bytes,
                log_path,
            };
            let outcome = self
                .dispatch(index, &rendered, &ctx)
                .map_err(|err| self.spawn_failure(index, &rendered, &err))?;
            let expected = rendered.expected_exit;
            if !outcome.succeeded(expected) {
                return Err(self.outcome_failure(index, &rendered, &outcome, expected, timeout));
            }
            if let Action::Register {
                verify: Some(listing),
                ..
            } = &rendered.action
            {
                self.verify_listing(
                    index,
                    &rendered,
                    &listing.command,
                    &listing.contains,
                    &ctx,
                    timeout,
                )?;
            }
            StepDone {
                command: Some(outcome.command),
                exit_code: outcome.exit_code,
            }
        };

        env.apply(&rendered.action)
            .map_err(|reason| StepFailure::rejected(index, &step.name, kind, reason))?;
        Ok(done)
    }

    /// Run the capability call for a command-backed action.
    fn dispatch(
        &self,
        index: usize,
        step: &Step,
        ctx: &StepContext<'_>,
    ) -> anyhow::Result<CommandOutcome> {
        let tools = &self.tools;
        let env = ctx.env;
        match &step.action {
            Action::Packages { manager, packages } => {
                tools.packages.install(*manager, packages, ctx)
            }
            Action::AddRepository {
                manager,
                repository,
                url,
            } => tools.packages.add_repository(*manager, repository, url, ctx),
            Action::Download { url, dest } => {
                tools.fetcher.download(url, &env.resolve(dest), ctx)
            }
            Action::Installer {
                url,
                args,
                interpreter,
            } => {
                let script = installer_script_path(&ctx.workdir, index);
                let script_arg = script.display().to_string();
                let fetched = tools.fetcher.download(url, &script, ctx)?;
                let outcome = if fetched.succeeded(0) {
                    let invocation = Invocation::new(interpreter.as_str(), [script_arg.as_str()])
                        .with_args(args.iter().cloned());
                    tools.runner.run(&ctx.request(invocation))
                } else {
                    Ok(fetched)
                };
                let remove =
                    ctx.cleanup_request(Invocation::new("rm", ["-f", script_arg.as_str()]));
                cleanup(tools.runner, &remove);
                outcome
            }
            Action::Clone {
                url,
                dest,
                reference,
            } => tools
                .fetcher
                .clone_repository(url, &env.resolve(dest), reference.as_deref(), ctx),
            Action::Copy { from, to, owner } => tools.fetcher.copy_tree(
                &env.resolve(from),
                &env.resolve(to),
                owner.as_deref(),
                ctx,
            ),
            Action::Build { command } => tools.builder.build(command, ctx),
            Action::Register { command, .. } => tools.builder.register(command, ctx),
            Action::CreateUser { user, home, shell } => {
                let home = home
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| default_home(user));
                tools.accounts.create_user(user, &home, shell, ctx)
            }
            Action::GrantSudo { user, commands } => {
                tools
                    .accounts
                    .grant_passwordless(user, &SudoGrant::from_commands(commands), ctx)
            }
            Action::Run { command } => tools.runner.run(&ctx.request(command.clone())),
            Action::SwitchUser { .. }
            | Action::PrependPath { .. }
            | Action::SetEnv { .. }
            | Action::ChangeDir { .. } => Err(anyhow::anyhow!(
                "{} runs no command",
                step.action.label()
            )),
        }
    }

    fn verify_listing(
        &self,
        index: usize,
        step: &Step,
        command: &Invocation,
        contains: &str,
        ctx: &StepContext<'_>,
        timeout: Duration,
    ) -> Result<(), StepFailure> {
        let listing = self
            .tools
            .builder
            .list_registered(command, ctx)
            .map_err(|err| self.spawn_failure(index, step, &err))?;
        if !listing.succeeded(0) {
            return Err(self.outcome_failure(index, step, &listing, 0, timeout));
        }
        if !listing.stdout_text().contains(contains) {
            let mut failure = StepFailure::rejected(
                index,
                &step.name,
                step.action.failure_kind(),
                format!("`{}` does not list '{contains}'", listing.command),
            );
            failure.command = Some(listing.command.clone());
            failure.exit_status = listing.exit_code;
            failure.output_tail = listing.tail(self.limits.failure_tail_bytes);
            return Err(failure);
        }
        Ok(())
    }

    /// Step timeout capped by what is left of the run budget.
    fn step_timeout(
        &self,
        index: usize,
        step: &Step,
        run_started: Instant,
    ) -> Result<Duration, StepFailure> {
        let configured = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.limits.step_timeout);
        let remaining = self.limits.run_timeout.saturating_sub(run_started.elapsed());
        if remaining.is_zero() {
            let mut failure = StepFailure::rejected(
                index,
                &step.name,
                step.action.failure_kind(),
                format!(
                    "run budget of {}s exhausted before the step started",
                    self.limits.run_timeout.as_secs()
                ),
            );
            failure.cause = FailureCause::TimedOut;
            return Err(failure);
        }
        if remaining < configured {
            warn!(
                step = %step.name,
                remaining_secs = remaining.as_secs(),
                "step timeout capped by remaining run budget"
            );
        }
        Ok(configured.min(remaining))
    }

    fn outcome_failure(
        &self,
        index: usize,
        step: &Step,
        outcome: &CommandOutcome,
        expected: i32,
        timeout: Duration,
    ) -> StepFailure {
        let (cause, reason) = if outcome.timed_out {
            (
                FailureCause::TimedOut,
                format!("`{}` timed out after {}s", outcome.command, timeout.as_secs()),
            )
        } else {
            let reason = match outcome.exit_code {
                Some(code) => format!(
                    "`{}` exited with status {code} (expected {expected})",
                    outcome.command
                ),
                None => format!("`{}` was terminated by a signal", outcome.command),
            };
            (FailureCause::ExitStatus, reason)
        };
        StepFailure {
            index,
            name: step.name.clone(),
            kind: step.action.failure_kind(),
            cause,
            command: Some(outcome.command.clone()),
            exit_status: outcome.exit_code,
            reason,
            output_tail: outcome.tail(self.limits.failure_tail_bytes),
        }
    }

    fn spawn_failure(&self, index: usize, step: &Step, err: &anyhow::Error) -> StepFailure {
        let mut failure = StepFailure::rejected(
            index,
            &step.name,
            step.action.failure_kind(),
            format!("{err:#}"),
        );
        failure.cause = FailureCause::Spawn;
        failure
    }
}

/// Lifecycle transitions are driven in order by `execute`; a rejected
/// transition is a bug worth surfacing in diagnostics, not a step failure.
fn track(result: Result<(), String>) {
    if let Err(err) = result {
        error!(%err, "lifecycle transition rejected");
    }
}

/// Script path an `installer` step downloads to, relative to `workdir`.
pub fn installer_script_path(workdir: &Path, index: usize) -> PathBuf {
    workdir.join(format!(".provision-installer-{:02}.sh", index + 1))
}
