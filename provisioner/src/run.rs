//! Orchestration for `provision init/check/plan/run/status`.

use std::cell::RefCell;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::core::environment::Environment;
use crate::core::lifecycle::Phase;
use crate::io::config::{ProvisionConfig, load_config, write_config};
use crate::io::plan::{LoadedPlan, load_plan, write_default_plan};
use crate::io::run_log::{
    LastRun, RunRecord, StatePaths, StepRecord, generate_run_id, load_last_run, load_run_record,
    now_rfc3339, write_last_run, write_run_record,
};
use crate::io::runner::{CommandRunner, DryRunRunner};
use crate::io::tools::{ShellTools, Toolbox};
use crate::provisioner::{Limits, Provisioner, RunReport, StepReport};

/// Create the state directory: default config (if missing) and the built-in plan.
pub fn init_state(state: &StatePaths, plan_path: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(&state.root)
        .with_context(|| format!("create state directory {}", state.root.display()))?;
    if force || !state.config_path.exists() {
        write_config(&state.config_path, &ProvisionConfig::default())?;
    }
    write_default_plan(plan_path, force)
}

/// Load a plan and check schema plus invariants against `base`.
pub fn check_plan(plan_path: &Path, base: &Environment) -> Result<LoadedPlan> {
    let plan = load_plan(plan_path)?;
    plan.check(base)?;
    Ok(plan)
}

/// Commands each step would run, grouped under a `NN name (action)` header.
///
/// Nothing is executed; environment effects are still simulated so later
/// steps render with the identity and paths they would really see.
pub fn dry_run_plan(
    plan: &LoadedPlan,
    base: &Environment,
    cfg: &ProvisionConfig,
) -> Result<Vec<String>> {
    plan.check(base)?;
    let tools = ShellTools::new(DryRunRunner::new(), &cfg.sudo.sudoers_dir);
    let lines = RefCell::new(Vec::new());
    let progress = |report: &StepReport| {
        let mut lines = lines.borrow_mut();
        lines.push(format!("{:02} {} ({})", report.index + 1, report.name, report.action));
        for command in tools.runner().take_lines() {
            lines.push(format!("    {command}"));
        }
    };
    let report = Provisioner::new(Toolbox::from_shell(&tools), Limits::from(cfg))
        .with_progress(&progress)
        .execute(plan.steps(), base);
    if let Err(failure) = report.result {
        bail!("dry run stopped: {failure}");
    }
    Ok(lines.into_inner())
}

/// Execute a plan, persisting the run record and step logs under `state`.
///
/// Refuses to start when a previous run is recorded unless `force` is set:
/// steps are written for a clean base and are not resumable.
#[instrument(skip_all, fields(plan = %plan.name(), force))]
pub fn run_plan<R: CommandRunner>(
    state: &StatePaths,
    plan: &LoadedPlan,
    base: &Environment,
    cfg: &ProvisionConfig,
    runner: R,
    force: bool,
    progress: &dyn Fn(&StepReport),
) -> Result<RunRecord> {
    if let Some(last) = load_last_run(&state.last_run_path)? {
        if !force {
            bail!(
                "previous run {} ({:?}) is recorded in {}; provisioning expects a clean base \
                 (use --force to run anyway)",
                last.run_id,
                last.phase,
                state.root.display()
            );
        }
        warn!(previous = %last.run_id, "re-running over a previous run");
    }
    plan.check(base)?;

    let run_id = generate_run_id();
    let paths = state.run(&run_id);
    fs::create_dir_all(&paths.steps_dir)
        .with_context(|| format!("create run directory {}", paths.steps_dir.display()))?;

    let mut record = RunRecord {
        run_id: run_id.clone(),
        plan_name: plan.name().to_string(),
        plan_path: plan.path.clone(),
        plan_digest: plan.digest.clone(),
        entrypoint: plan.file.plan.entrypoint.clone(),
        phase: Phase::Running,
        started_at: now_rfc3339(),
        ended_at: None,
        duration_ms: None,
        steps: Vec::new(),
        failure: None,
        environment: None,
    };
    write_run_record(&paths.record_path, &record)?;
    write_pointer(state, &record, &paths.record_path)?;
    info!(run_id = %run_id, steps = plan.steps().len(), "run started");

    let tools = ShellTools::new(runner, &cfg.sudo.sudoers_dir);
    let report = Provisioner::new(Toolbox::from_shell(&tools), Limits::from(cfg))
        .with_log_dir(&paths.steps_dir)
        .with_progress(progress)
        .execute(plan.steps(), base);

    finish_record(&mut record, report);
    write_run_record(&paths.record_path, &record)?;
    write_pointer(state, &record, &paths.record_path)?;
    info!(run_id = %run_id, phase = ?record.phase, "run finished");
    Ok(record)
}

/// Record of the most recent run, if any.
pub fn last_run_record(state: &StatePaths) -> Result<Option<RunRecord>> {
    match load_last_run(&state.last_run_path)? {
        Some(last) => Ok(Some(load_run_record(&last.record_path)?)),
        None => Ok(None),
    }
}

/// Human-readable summary for `provision status` and the end of `provision run`.
pub fn format_summary(record: &RunRecord) -> String {
    let mut out = format!(
        "run {} ({}): {}\n",
        record.run_id,
        record.plan_name,
        phase_label(record.phase)
    );
    for step in &record.steps {
        let mut line = format!(
            "  {:02} {:<9} {} ({})",
            step.index + 1,
            phase_label(step.phase),
            step.name,
            step.action
        );
        if let Some(code) = step.exit_code
            && step.phase == Phase::Failed
        {
            line.push_str(&format!(" exit {code}"));
        }
        if step.timed_out {
            line.push_str(" timed out");
        }
        out.push_str(&line);
        out.push('\n');
    }
    if let Some(failure) = &record.failure {
        out.push_str(&format!("{failure}\n"));
        if let Some(command) = &failure.command {
            out.push_str(&format!("command: {command}\n"));
        }
        if !failure.output_tail.is_empty() {
            out.push_str("output tail:\n");
            out.push_str(&failure.output_tail);
            out.push('\n');
        }
    }
    out
}

/// Load config from the state directory.
pub fn load_state_config(state: &StatePaths) -> Result<ProvisionConfig> {
    load_config(&state.config_path)
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "pending",
        Phase::Running => "running",
        Phase::Succeeded => "succeeded",
        Phase::Failed => "failed",
    }
}

fn finish_record(record: &mut RunRecord, report: RunReport) {
    record.phase = report.lifecycle.run_phase();
    record.ended_at = Some(now_rfc3339());
    record.duration_ms = Some(report.duration.as_millis() as u64);
    record.steps = report
        .steps
        .into_iter()
        .map(|step| StepRecord {
            index: step.index,
            name: step.name,
            action: step.action.to_string(),
            phase: step.phase,
            command: step.command,
            exit_code: step.exit_code,
            timed_out: step.timed_out,
            duration_ms: step.duration.map(|d| d.as_millis() as u64),
        })
        .collect();
    match report.result {
        Ok(env) => record.environment = Some(env),
        Err(failure) => record.failure = Some(failure),
    }
}

fn write_pointer(state: &StatePaths, record: &RunRecord, record_path: &Path) -> Result<()> {
    write_last_run(
        &state.last_run_path,
        &LastRun {
            run_id: record.run_id.clone(),
            phase: record.phase,
            record_path: record_path.to_path_buf(),
        },
    )
}
