//! Semantic plan invariants beyond what the JSON schema can express.
//!
//! The plan is simulated against the base environment: templates are
//! rendered and environment effects applied in order, so checks see the
//! identity and paths each step will actually run with.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::environment::Environment;
use super::step::{Action, Privilege, Step};
use super::template::Renderer;

static STEP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("step name regex"));
/// Characters with meaning inside a sudoers command list.
const SUDOERS_SPECIAL: &[char] = &[',', ':', '=', '\\', '\n'];

static USER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("user name regex"));

/// Validate a plan, returning human-readable violations (empty when valid).
pub fn validate_plan(steps: &[Step], base: &Environment) -> Vec<String> {
    let mut errors = Vec::new();
    if steps.is_empty() {
        errors.push("plan must declare at least one step".to_string());
        return errors;
    }

    let mut seen = BTreeSet::new();
    for step in steps {
        if !STEP_NAME_RE.is_match(&step.name) {
            errors.push(format!(
                "step name '{}' must match [A-Za-z0-9._-]+",
                step.name
            ));
        }
        if !seen.insert(step.name.as_str()) {
            errors.push(format!("duplicate step name: {}", step.name));
        }
    }

    let renderer = Renderer::new();
    let mut env = base.clone();
    for (index, step) in steps.iter().enumerate() {
        let label = format!("step {} `{}`", index + 1, step.name);
        check_static(step, &label, &mut errors);

        let rendered = match renderer.render_step(step, &env) {
            Ok(rendered) => rendered,
            Err(err) => {
                errors.push(format!("{label}: {err:#}"));
                // Later steps depend on this one's effect; stop simulating.
                break;
            }
        };

        let reported = errors.len();
        check_rendered(&rendered, &env, &label, &mut errors);

        if let Err(err) = env.apply(&rendered.action) {
            // A relative dir is already reported with its rendered value.
            let dir_reported = errors.len() > reported
                && matches!(
                    rendered.action,
                    Action::PrependPath { .. } | Action::ChangeDir { .. }
                );
            if !dir_reported {
                errors.push(format!("{label}: {err}"));
            }
            break;
        }
    }
    errors
}

fn check_static(step: &Step, label: &str, errors: &mut Vec<String>) {
    if step.expected_exit != 0 && !step.action.is_single_command() {
        errors.push(format!(
            "{label}: expected_exit is only allowed on single-command actions (got {} on {})",
            step.expected_exit,
            step.action.label()
        ));
    }
    if step.timeout_secs == Some(0) {
        errors.push(format!("{label}: timeout_secs must be > 0"));
    }
    if step.action.is_environment_only() && step.privilege == Privilege::Elevated {
        errors.push(format!(
            "{label}: {} runs no command and cannot be elevated",
            step.action.label()
        ));
    }
}

fn check_rendered(step: &Step, env: &Environment, label: &str, errors: &mut Vec<String>) {
    match &step.action {
        Action::Packages { packages, .. } => {
            if packages.is_empty() {
                errors.push(format!("{label}: packages must not be empty"));
            }
            if packages.iter().any(|p| p.trim().is_empty()) {
                errors.push(format!("{label}: package names must not be blank"));
            }
        }
        Action::AddRepository { repository, url, .. } => {
            if repository.trim().is_empty() || url.trim().is_empty() {
                errors.push(format!("{label}: repository and url must not be blank"));
            }
        }
        Action::Build { command } | Action::Run { command } => {
            if command.program.trim().is_empty() {
                errors.push(format!("{label}: command program must not be blank"));
            }
        }
        Action::Register { command, verify } => {
            if command.program.trim().is_empty() {
                errors.push(format!("{label}: command program must not be blank"));
            }
            if let Some(listing) = verify
                && listing.contains.trim().is_empty()
            {
                errors.push(format!("{label}: verify.contains must not be blank"));
            }
        }
        Action::CreateUser { user, .. } => {
            check_user_name(user, label, errors);
        }
        Action::GrantSudo { user, commands } => {
            check_user_name(user, label, errors);
            for command in commands {
                if !Path::new(command).is_absolute() {
                    errors.push(format!(
                        "{label}: sudo grant command '{command}' must be an absolute path"
                    ));
                }
                if command.contains(SUDOERS_SPECIAL) {
                    errors.push(format!(
                        "{label}: sudo grant command '{command}' must not contain \
                         any of , : = \\ or a newline"
                    ));
                }
            }
        }
        Action::SwitchUser { user } => check_user_name(user, label, errors),
        Action::PrependPath { dir } | Action::ChangeDir { dir } => {
            if !Path::new(dir).is_absolute() {
                errors.push(format!(
                    "{label}: {} dir '{dir}' must render to an absolute path",
                    step.action.label()
                ));
            }
        }
        Action::Copy {
            owner: Some(owner), ..
        } => {
            if env.account(owner).is_none() {
                errors.push(format!("{label}: copy owner '{owner}' is not a known account"));
            }
        }
        _ => {}
    }

    if step.privilege == Privilege::Elevated && !env.can_elevate() && env.is_switched() {
        errors.push(format!(
            "{label}: elevated step runs as '{}' who has no passwordless sudo grant",
            env.user
        ));
    }
}

fn check_user_name(user: &str, label: &str, errors: &mut Vec<String>) {
    if !USER_NAME_RE.is_match(user) {
        errors.push(format!(
            "{label}: user name '{user}' must match [a-z_][a-z0-9_-]{{0,31}}"
        ));
    }
}
