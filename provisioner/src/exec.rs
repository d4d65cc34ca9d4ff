//! `provision exec`: run a command inside the last provisioned environment.

use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{error, info, instrument, warn};

use crate::core::environment::Environment;
use crate::core::lifecycle::Phase;
use crate::core::privilege::{Launch, launch_for};
use crate::core::step::{Invocation, Privilege};
use crate::exit_codes;
use crate::io::process::run_inherited;
use crate::io::run_log::{RunRecord, StatePaths};
use crate::run::last_run_record;

/// Environment and entrypoint persisted by the last successful run.
pub fn provisioned_environment(state: &StatePaths) -> Result<(Environment, Option<Invocation>)> {
    let record = last_run_record(state)?.with_context(|| {
        format!(
            "no run recorded in {}; run `provision run` first",
            state.root.display()
        )
    })?;
    environment_of(record)
}

fn environment_of(record: RunRecord) -> Result<(Environment, Option<Invocation>)> {
    if record.phase != Phase::Succeeded {
        bail!(
            "last run {} did not succeed ({:?}); the environment is not provisioned",
            record.run_id,
            record.phase
        );
    }
    let env = record
        .environment
        .with_context(|| format!("run record {} has no environment", record.run_id))?;
    Ok((env, record.entrypoint))
}

/// Command line `argv` runs as: the entrypoint prefix followed by `argv`.
pub fn exec_invocation(entrypoint: Option<&Invocation>, argv: &[String]) -> Result<Invocation> {
    if argv.is_empty() {
        bail!("exec needs a command to run");
    }
    let invocation = match entrypoint {
        Some(prefix) => prefix.clone().with_args(argv.iter().cloned()),
        None => Invocation::new(argv[0].clone(), argv[1..].iter().cloned()),
    };
    Ok(invocation)
}

/// Process launch for `argv` under the provisioned identity.
pub fn exec_launch(
    env: &Environment,
    entrypoint: Option<&Invocation>,
    argv: &[String],
    sudo: &str,
) -> Result<(Launch, String)> {
    let invocation = exec_invocation(entrypoint, argv)?;
    let shown = invocation.to_string();
    Ok((launch_for(&invocation, env, Privilege::Normal, sudo), shown))
}

/// Run `argv` attached to the terminal and return the exit code to report.
#[instrument(skip_all)]
pub fn exec_command(state: &StatePaths, argv: &[String], sudo: &str) -> Result<i32> {
    let (env, entrypoint) = provisioned_environment(state)?;
    let (launch, shown) = exec_launch(&env, entrypoint.as_ref(), argv, sudo)?;
    info!(command = %shown, user = %env.user, "exec in provisioned environment");

    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args)
        .env_clear()
        .envs(&launch.env)
        .current_dir(&env.workdir);

    match run_inherited(cmd, &shown) {
        Ok(Some(code)) => Ok(code),
        Ok(None) => {
            warn!(command = %shown, "command terminated by a signal");
            Ok(exit_codes::INVALID)
        }
        Err(err) => {
            let message = format!("{err:#}");
            error!(err = %message, "could not start command");
            Ok(exit_codes::SPAWN_FAILED)
        }
    }
}
