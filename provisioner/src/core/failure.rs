//! Failure taxonomy for provisioning steps.
//!
//! Every kind shares one propagation policy: the run stops at the failing
//! step, nothing is retried and nothing is rolled back. The kind only labels
//! which collaborator failed.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PackageInstall,
    Download,
    RepositoryClone,
    Build,
    Registration,
    AccountSetup,
    Environment,
    Command,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::PackageInstall => "package install failure",
            FailureKind::Download => "download failure",
            FailureKind::RepositoryClone => "repository clone failure",
            FailureKind::Build => "build failure",
            FailureKind::Registration => "registration failure",
            FailureKind::AccountSetup => "account setup failure",
            FailureKind::Environment => "environment failure",
            FailureKind::Command => "command failure",
        };
        f.write_str(label)
    }
}

/// Why the step stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The command exited with a status other than the expected one.
    ExitStatus,
    /// The command exceeded its timeout (or the run budget was exhausted).
    TimedOut,
    /// The command could not be started at all.
    Spawn,
    /// The step was rejected before or after running commands (bad template,
    /// unknown user, artifact not listed).
    Rejected,
}

/// Structured report of the step that terminated a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("step {} `{name}` failed ({kind}): {reason}", .index + 1)]
pub struct StepFailure {
    /// Zero-based position of the step in the plan.
    pub index: usize,
    pub name: String,
    pub kind: FailureKind,
    pub cause: FailureCause,
    /// Rendered command that failed, when the step got as far as running one.
    pub command: Option<String>,
    pub exit_status: Option<i32>,
    pub reason: String,
    /// Tail of the failing command's stderr/stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

impl StepFailure {
    pub fn rejected(
        index: usize,
        name: &str,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            index,
            name: name.to_string(),
            kind,
            cause: FailureCause::Rejected,
            command: None,
            exit_status: None,
            reason: reason.into(),
            output_tail: String::new(),
        }
    }

    pub fn timed_out(&self) -> bool {
        self.cause == FailureCause::TimedOut
    }
}
