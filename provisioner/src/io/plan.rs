//! Plan load/write helpers with schema + invariant validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::core::environment::Environment;
use crate::core::invariants::validate_plan;
use crate::core::step::{Invocation, Step};

/// Built-in plan provisioning the binary analysis platform and its plugin.
pub const DEFAULT_PLAN: &str = include_str!("../../plans/analysis_platform.toml");

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan/v1.schema.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Command prefix `provision exec` runs user commands through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Invocation>,
}

/// On-disk plan document (`[plan]` table plus `[[steps]]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    pub plan: PlanMeta,
    pub steps: Vec<Step>,
}

/// Schema-checked plan together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub path: PathBuf,
    pub file: PlanFile,
    /// Hex SHA-256 of the plan text.
    pub digest: String,
}

impl LoadedPlan {
    pub fn steps(&self) -> &[Step] {
        &self.file.steps
    }

    pub fn name(&self) -> &str {
        &self.file.plan.name
    }

    /// Semantic invariants, simulated against `base`.
    pub fn check(&self, base: &Environment) -> Result<()> {
        let errors = validate_plan(&self.file.steps, base);
        if errors.is_empty() {
            return Ok(());
        }
        bail!(
            "plan {} violates invariants:\n- {}",
            self.path.display(),
            errors.join("\n- ")
        )
    }
}

/// Read, schema-validate and deserialize a plan file.
pub fn load_plan(path: &Path) -> Result<LoadedPlan> {
    debug!(path = %path.display(), "loading plan");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let file = parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))?;
    Ok(LoadedPlan {
        path: path.to_path_buf(),
        file,
        digest: plan_digest(&contents),
    })
}

/// Parse plan TOML and validate it against the embedded JSON schema.
pub fn parse_plan(contents: &str) -> Result<PlanFile> {
    let value: Value = toml::from_str(contents).context("parse plan toml")?;
    validate_schema(&value)?;
    serde_json::from_value(value).context("deserialize plan")
}

/// Write the built-in plan. Refuses to overwrite unless `force` is set.
pub fn write_default_plan(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "plan already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, DEFAULT_PLAN).with_context(|| format!("write plan {}", path.display()))?;
    info!(path = %path.display(), "wrote default plan");
    Ok(())
}

pub fn plan_digest(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate a plan instance against the plan JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("compile plan schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("plan schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
