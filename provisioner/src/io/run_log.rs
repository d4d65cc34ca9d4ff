//! Run records and step logs under `<state>/runs/`.
//!
//! Layout:
//!
//! ```text
//! <state>/config.toml
//! <state>/plan.toml
//! <state>/last_run.json            pointer to the most recent run
//! <state>/runs/<run-id>/run.json   RunRecord
//! <state>/runs/<run-id>/steps/NN-<name>.log
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::environment::Environment;
use crate::core::failure::StepFailure;
use crate::core::lifecycle::Phase;
use crate::core::step::Invocation;

/// Well-known files inside the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub plan_path: PathBuf,
    pub last_run_path: PathBuf,
    pub runs_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.to_path_buf(),
            config_path: state_dir.join("config.toml"),
            plan_path: state_dir.join("plan.toml"),
            last_run_path: state_dir.join("last_run.json"),
            runs_dir: state_dir.join("runs"),
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        let dir = self.runs_dir.join(run_id);
        RunPaths {
            record_path: dir.join("run.json"),
            steps_dir: dir.join("steps"),
            dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub record_path: PathBuf,
    pub steps_dir: PathBuf,
}

impl RunPaths {
    pub fn step_log_path(&self, index: usize, name: &str) -> PathBuf {
        step_log_path(&self.steps_dir, index, name)
    }
}

/// `NN-<name>.log` with a one-based, zero-padded position.
pub fn step_log_path(steps_dir: &Path, index: usize, name: &str) -> PathBuf {
    steps_dir.join(format!("{:02}-{name}.log", index + 1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub action: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Persisted audit of one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan_name: String,
    pub plan_path: PathBuf,
    pub plan_digest: String,
    /// Command prefix `provision exec` wraps user commands with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Invocation>,
    pub phase: Phase,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// Final environment, present only when every step succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

/// Pointer to the most recent run (`<state>/last_run.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: String,
    pub phase: Phase,
    pub record_path: PathBuf,
}

/// `run-YYYYmmdd_HHMMSS-xxxxxx`.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let short_id = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run-{}-{short_id}", Utc::now().format("%Y%m%d_%H%M%S"))
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn write_run_record(path: &Path, record: &RunRecord) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = %record.run_id,
        phase = ?record.phase,
        "writing run record"
    );
    write_json_atomic(path, record)
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse run record {}", path.display()))
}

pub fn write_last_run(path: &Path, last: &LastRun) -> Result<()> {
    write_json_atomic(path, last)
}

/// Load the last-run pointer; `None` when no run has been recorded.
pub fn load_last_run(path: &Path) -> Result<Option<LastRun>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let last = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(last))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let state = StatePaths::new(Path::new("/srv/.provision"));
        let run = state.run("run-1");
        assert_eq!(run.record_path, PathBuf::from("/srv/.provision/runs/run-1/run.json"));
        assert_eq!(
            run.step_log_path(2, "bap-repository"),
            PathBuf::from("/srv/.provision/runs/run-1/steps/03-bap-repository.log")
        );
        assert_eq!(state.last_run_path, PathBuf::from("/srv/.provision/last_run.json"));
    }

    #[test]
    fn run_id_has_timestamp_and_suffix() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1].len(), "20260101_120000".len());
        assert_eq!(parts[2].len(), 6);
        assert_ne!(id, generate_run_id());
    }

    #[test]
    fn record_and_pointer_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StatePaths::new(temp.path());
        assert_eq!(load_last_run(&state.last_run_path).expect("load"), None);

        let run = state.run("run-1");
        let record = RunRecord {
            run_id: "run-1".to_string(),
            plan_name: "demo".to_string(),
            plan_path: PathBuf::from("plan.toml"),
            plan_digest: "abc".to_string(),
            entrypoint: Some(Invocation::new("opam", ["config", "exec", "--"])),
            phase: Phase::Succeeded,
            started_at: now_rfc3339(),
            ended_at: Some(now_rfc3339()),
            duration_ms: Some(5),
            steps: vec![StepRecord {
                index: 0,
                name: "hello".to_string(),
                action: "run".to_string(),
                phase: Phase::Succeeded,
                command: Some("echo hello".to_string()),
                exit_code: Some(0),
                timed_out: false,
                duration_ms: Some(1),
            }],
            failure: None,
            environment: None,
        };
        write_run_record(&run.record_path, &record).expect("write record");
        assert_eq!(load_run_record(&run.record_path).expect("load record"), record);

        let last = LastRun {
            run_id: "run-1".to_string(),
            phase: Phase::Succeeded,
            record_path: run.record_path.clone(),
        };
        write_last_run(&state.last_run_path, &last).expect("write pointer");
        assert_eq!(load_last_run(&state.last_run_path).expect("load"), Some(last));
    }
}
