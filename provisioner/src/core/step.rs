//! Step model: the ordered units of work a plan declares.
//!
//! Steps are plain data. String fields may contain minijinja expressions that
//! are rendered against the current [`Environment`](super::environment::Environment)
//! right before the step executes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::failure::FailureKind;

/// Privilege level a step's commands run with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    /// Run as the active user.
    #[default]
    Normal,
    /// Run through non-interactive `sudo` on behalf of the active user.
    Elevated,
}

/// Package manager a `packages` or `add_repository` step talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    /// Debian/Ubuntu system packages (`apt-get`, `add-apt-repository`).
    Apt,
    /// OCaml package manager used by the analysis platform.
    Opam,
}

impl PackageManager {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt",
            PackageManager::Opam => "opam",
        }
    }
}

/// A program and its arguments, e.g. `["make", "all"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Append arguments, returning the extended invocation.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl TryFrom<Vec<String>> for Invocation {
    type Error = String;

    fn try_from(mut argv: Vec<String>) -> Result<Self, Self::Error> {
        if argv.is_empty() {
            return Err("command must be a non-empty array".to_string());
        }
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
        })
    }
}

impl From<Invocation> for Vec<String> {
    fn from(invocation: Invocation) -> Self {
        invocation.argv()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.argv().iter().map(|arg| quote(arg)).collect();
        f.write_str(&rendered.join(" "))
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ',' | '+' | '@')
        });
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Command whose stdout must mention the registered artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub command: Invocation,
    pub contains: String,
}

fn default_interpreter() -> String {
    "sh".to_string()
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// What a step does. Serialized with an `action` tag (`action = "packages"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Packages {
        manager: PackageManager,
        packages: Vec<String>,
    },
    AddRepository {
        manager: PackageManager,
        repository: String,
        url: String,
    },
    Download {
        url: String,
        dest: String,
    },
    /// Download a remote installer script and execute it with `interpreter`.
    Installer {
        url: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_interpreter")]
        interpreter: String,
    },
    Clone {
        url: String,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
    /// Copy a local source tree into the environment.
    Copy {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    Build {
        command: Invocation,
    },
    Register {
        command: Invocation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verify: Option<Listing>,
    },
    CreateUser {
        user: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        home: Option<String>,
        #[serde(default = "default_shell")]
        shell: String,
    },
    /// Grant passwordless `sudo`. An empty `commands` list grants everything.
    GrantSudo {
        user: String,
        #[serde(default)]
        commands: Vec<String>,
    },
    SwitchUser {
        user: String,
    },
    PrependPath {
        dir: String,
    },
    SetEnv {
        key: String,
        value: String,
    },
    ChangeDir {
        dir: String,
    },
    Run {
        command: Invocation,
    },
}

impl Action {
    /// Stable action tag, identical to the serialized `action` value.
    pub fn label(&self) -> &'static str {
        match self {
            Action::Packages { .. } => "packages",
            Action::AddRepository { .. } => "add_repository",
            Action::Download { .. } => "download",
            Action::Installer { .. } => "installer",
            Action::Clone { .. } => "clone",
            Action::Copy { .. } => "copy",
            Action::Build { .. } => "build",
            Action::Register { .. } => "register",
            Action::CreateUser { .. } => "create_user",
            Action::GrantSudo { .. } => "grant_sudo",
            Action::SwitchUser { .. } => "switch_user",
            Action::PrependPath { .. } => "prepend_path",
            Action::SetEnv { .. } => "set_env",
            Action::ChangeDir { .. } => "change_dir",
            Action::Run { .. } => "run",
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Action::Packages { .. } | Action::AddRepository { .. } => FailureKind::PackageInstall,
            Action::Download { .. } | Action::Installer { .. } => FailureKind::Download,
            Action::Clone { .. } | Action::Copy { .. } => FailureKind::RepositoryClone,
            Action::Build { .. } => FailureKind::Build,
            Action::Register { .. } => FailureKind::Registration,
            Action::CreateUser { .. } | Action::GrantSudo { .. } | Action::SwitchUser { .. } => {
                FailureKind::AccountSetup
            }
            Action::PrependPath { .. } | Action::SetEnv { .. } | Action::ChangeDir { .. } => {
                FailureKind::Environment
            }
            Action::Run { .. } => FailureKind::Command,
        }
    }

    /// True when the step maps onto exactly one external command, so a
    /// non-zero `expected_exit` is meaningful.
    pub fn is_single_command(&self) -> bool {
        matches!(
            self,
            Action::Run { .. } | Action::Build { .. } | Action::Register { verify: None, .. }
        )
    }

    /// True when the step only mutates the threaded environment.
    pub fn is_environment_only(&self) -> bool {
        matches!(
            self,
            Action::SwitchUser { .. }
                | Action::PrependPath { .. }
                | Action::SetEnv { .. }
                | Action::ChangeDir { .. }
        )
    }
}

/// One ordered unit of provisioning work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(flatten)]
    pub action: Action,
    /// Working directory override; relative paths resolve against the
    /// environment's working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub privilege: Privilege,
    #[serde(default)]
    pub expected_exit: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            action,
            workdir: None,
            privilege: Privilege::Normal,
            expected_exit: 0,
            timeout_secs: None,
        }
    }

    pub fn elevated(mut self) -> Self {
        self.privilege = Privilege::Elevated;
        self
    }
}
