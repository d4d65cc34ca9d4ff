//! Provisioner configuration stored under `<state>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Provisioner configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty or absent file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Timeout for a step that does not set `timeout_secs`.
    pub step_timeout_secs: u64,

    /// Wall-clock budget for the whole run; caps every step timeout.
    pub run_timeout_secs: u64,

    /// Keep at most this many bytes of each command's stdout/stderr in memory.
    /// Step logs always receive the full output.
    pub output_limit_bytes: usize,

    /// Bytes of the failing command's output copied into the failure report.
    pub failure_tail_bytes: usize,

    pub sudo: SudoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SudoConfig {
    /// Program used for identity switching and elevation.
    pub program: String,
    /// Directory receiving per-user sudoers drop-ins.
    pub sudoers_dir: PathBuf,
}

impl Default for SudoConfig {
    fn default() -> Self {
        Self {
            program: "sudo".to_string(),
            sudoers_dir: PathBuf::from("/etc/sudoers.d"),
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 30 * 60,
            run_timeout_secs: 4 * 60 * 60,
            output_limit_bytes: 100_000,
            failure_tail_bytes: 4_000,
            sudo: SudoConfig::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.failure_tail_bytes == 0 {
            return Err(anyhow!("failure_tail_bytes must be > 0"));
        }
        if self.sudo.program.trim().is_empty() {
            return Err(anyhow!("sudo.program must not be empty"));
        }
        if !self.sudo.sudoers_dir.is_absolute() {
            return Err(anyhow!(
                "sudo.sudoers_dir must be absolute (got {})",
                self.sudo.sudoers_dir.display()
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProvisionConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProvisionConfig> {
    if !path.exists() {
        let cfg = ProvisionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProvisionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ProvisionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ProvisionConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/config.toml");
        let mut cfg = ProvisionConfig::default();
        cfg.step_timeout_secs = 90;
        cfg.sudo.sudoers_dir = PathBuf::from("/tmp/sudoers.d");
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "run_timeout_secs = 60\n[sudo]\nprogram = \"doas\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.run_timeout_secs, 60);
        assert_eq!(cfg.sudo.program, "doas");
        assert_eq!(cfg.sudo.sudoers_dir, PathBuf::from("/etc/sudoers.d"));
        assert_eq!(cfg.step_timeout_secs, 30 * 60);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "step_timeout_secs = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("step_timeout_secs must be > 0"));
    }
}
