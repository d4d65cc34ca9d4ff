//! The environment value threaded through every step.
//!
//! Search path, working directory and active identity are modeled explicitly
//! instead of living in ambient process state. Steps receive the current
//! value, and environment-mutating actions produce the next one. Nothing is
//! ever rolled back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::step::Action;

/// Variables owned by the model itself; `set_env` may not touch them.
pub const MODELED_VARS: [&str; 4] = ["PATH", "HOME", "USER", "LOGNAME"];

/// Passwordless `sudo` grant recorded for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SudoGrant {
    All,
    Commands(Vec<String>),
}

impl SudoGrant {
    pub fn from_commands(commands: &[String]) -> Self {
        if commands.is_empty() {
            SudoGrant::All
        } else {
            SudoGrant::Commands(commands.to_vec())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub home: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<SudoGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Identity of the process that launched the provisioner.
    pub invoking_user: String,
    /// Identity later steps run as.
    pub user: String,
    pub home: PathBuf,
    pub workdir: PathBuf,
    /// Executable search path, highest priority first.
    pub search_path: Vec<PathBuf>,
    /// Exported variables other than [`MODELED_VARS`].
    pub vars: BTreeMap<String, String>,
    pub accounts: BTreeMap<String, Account>,
}

impl Environment {
    /// Base environment where the invoking user is also the active user.
    pub fn new(
        invoking_user: impl Into<String>,
        home: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        search_path: Vec<PathBuf>,
    ) -> Self {
        let user = invoking_user.into();
        let home = home.into();
        let mut accounts = BTreeMap::new();
        accounts.insert(
            user.clone(),
            Account {
                name: user.clone(),
                home: home.clone(),
                sudo: None,
            },
        );
        Self {
            invoking_user: user.clone(),
            user,
            home,
            workdir: workdir.into(),
            search_path,
            vars: BTreeMap::new(),
            accounts,
        }
    }

    /// `PATH` value for the current search path.
    pub fn path_string(&self) -> String {
        self.search_path
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// All variables a child process should see.
    pub fn exported_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        vars.insert("PATH".to_string(), self.path_string());
        vars.insert("HOME".to_string(), self.home.display().to_string());
        vars.insert("USER".to_string(), self.user.clone());
        vars.insert("LOGNAME".to_string(), self.user.clone());
        vars
    }

    pub fn is_switched(&self) -> bool {
        self.user != self.invoking_user
    }

    /// Whether the active user can run elevated commands without a prompt.
    pub fn can_elevate(&self) -> bool {
        self.user == "root"
            || self
                .accounts
                .get(&self.user)
                .is_some_and(|account| account.sudo.is_some())
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    /// Resolve a possibly-relative path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workdir.join(candidate)
        }
    }

    /// Put `dir` at the front of the search path, dropping any older entry.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) -> Result<(), String> {
        let dir = dir.into();
        if !dir.is_absolute() {
            return Err(format!("search path entry must be absolute: {}", dir.display()));
        }
        self.search_path.retain(|existing| existing != &dir);
        self.search_path.insert(0, dir);
        Ok(())
    }

    pub fn set_var(&mut self, key: &str, value: &str) -> Result<(), String> {
        if key.is_empty() || key.contains('=') {
            return Err(format!("invalid variable name '{key}'"));
        }
        if MODELED_VARS.contains(&key) {
            return Err(format!(
                "'{key}' is managed by prepend_path/switch_user and cannot be set directly"
            ));
        }
        self.vars.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn change_dir(&mut self, dir: impl Into<PathBuf>) -> Result<(), String> {
        let dir = dir.into();
        if !dir.is_absolute() {
            return Err(format!("working directory must be absolute: {}", dir.display()));
        }
        self.workdir = dir;
        Ok(())
    }

    pub fn add_account(&mut self, name: &str, home: impl Into<PathBuf>) -> Result<(), String> {
        if self.accounts.contains_key(name) {
            return Err(format!("account '{name}' already exists"));
        }
        self.accounts.insert(
            name.to_string(),
            Account {
                name: name.to_string(),
                home: home.into(),
                sudo: None,
            },
        );
        Ok(())
    }

    pub fn grant(&mut self, name: &str, grant: SudoGrant) -> Result<(), String> {
        let account = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| format!("unknown account '{name}'"))?;
        account.sudo = Some(grant);
        Ok(())
    }

    /// Make `name` the active identity; `HOME` follows the account.
    pub fn switch_user(&mut self, name: &str) -> Result<(), String> {
        let account = self
            .accounts
            .get(name)
            .ok_or_else(|| format!("unknown account '{name}'"))?;
        self.home = account.home.clone();
        self.user = name.to_string();
        Ok(())
    }

    /// Apply the environment effect of an already-rendered action.
    ///
    /// Actions without an environment effect leave the value untouched.
    pub fn apply(&mut self, action: &Action) -> Result<(), String> {
        match action {
            Action::CreateUser { user, home, .. } => {
                let home = home
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| default_home(user));
                self.add_account(user, home)
            }
            Action::GrantSudo { user, commands } => {
                self.grant(user, SudoGrant::from_commands(commands))
            }
            Action::SwitchUser { user } => self.switch_user(user),
            Action::PrependPath { dir } => self.prepend_path(dir),
            Action::SetEnv { key, value } => self.set_var(key, value),
            Action::ChangeDir { dir } => self.change_dir(dir),
            _ => Ok(()),
        }
    }
}

/// Home directory `useradd --create-home` picks when none is given.
pub fn default_home(user: &str) -> PathBuf {
    if user == "root" {
        PathBuf::from("/root")
    } else {
        PathBuf::from("/home").join(user)
    }
}
