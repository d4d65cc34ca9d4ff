//! Detect the base environment from the invoking process.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::environment::{Environment, default_home};

/// Search path used when the process has no `PATH`.
const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Variables carried over from the invoking process into the base environment.
const INHERITED_VARS: [&str; 4] = ["LANG", "LC_ALL", "TERM", "TZ"];

/// Build the base environment for a run started from the current process.
pub fn detect_environment() -> Result<Environment> {
    let user = current_user()?;
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home(&user));
    let workdir = env::current_dir().context("read current directory")?;
    let path = env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());

    let vars: BTreeMap<String, String> = INHERITED_VARS
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();

    let mut base = Environment::new(user, home, workdir, split_path(&path));
    base.vars = vars;
    debug!(user = %base.user, path = %base.path_string(), "detected base environment");
    Ok(base)
}

/// Split a `PATH` value, dropping empty and relative entries.
pub fn split_path(path: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in path.split(':') {
        let dir = PathBuf::from(entry);
        if entry.is_empty() || !dir.is_absolute() || dirs.contains(&dir) {
            continue;
        }
        dirs.push(dir);
    }
    dirs
}

fn current_user() -> Result<String> {
    for key in ["USER", "LOGNAME"] {
        if let Ok(value) = env::var(key)
            && !value.trim().is_empty()
        {
            return Ok(value);
        }
    }
    let output = Command::new("id")
        .arg("-un")
        .output()
        .context("run id -un")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("id -un failed: {}", stderr.trim()));
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() {
        return Err(anyhow!("id -un printed no user name"));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_drops_relative_empty_and_duplicate_entries() {
        let dirs = split_path("/usr/bin::bin:/bin:/usr/bin");
        assert_eq!(dirs, vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")]);
    }

    #[cfg(unix)]
    #[test]
    fn detects_a_usable_base() {
        let base = detect_environment().expect("detect");
        assert!(!base.user.is_empty());
        assert!(!base.is_switched());
        assert!(base.workdir.is_absolute());
        assert!(base.account(&base.user).is_some());
    }
}
