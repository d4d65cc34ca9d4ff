//! Run and step lifecycle: `PENDING -> RUNNING -> {SUCCEEDED, FAILED}`.
//!
//! No retries and no pause/resume, so terminal phases never transition again.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    /// Validate and perform a transition.
    pub fn advance(self, next: Phase) -> Result<Phase, String> {
        match (self, next) {
            (Phase::Pending, Phase::Running)
            | (Phase::Running, Phase::Succeeded)
            | (Phase::Running, Phase::Failed) => Ok(next),
            _ => Err(format!("illegal phase transition {self:?} -> {next:?}")),
        }
    }
}

/// Phase tracker for a sequence of steps plus the run itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    run: Phase,
    steps: Vec<Phase>,
}

impl Lifecycle {
    pub fn new(step_count: usize) -> Self {
        Self {
            run: Phase::Pending,
            steps: vec![Phase::Pending; step_count],
        }
    }

    pub fn run_phase(&self) -> Phase {
        self.run
    }

    pub fn step_phases(&self) -> &[Phase] {
        &self.steps
    }

    pub fn start_run(&mut self) -> Result<(), String> {
        self.run = self.run.advance(Phase::Running)?;
        Ok(())
    }

    /// Mark step `index` running. Its predecessor must have succeeded.
    pub fn start_step(&mut self, index: usize) -> Result<(), String> {
        if self.run != Phase::Running {
            return Err(format!("cannot start step {index}: run is {:?}", self.run));
        }
        if index > 0 && self.steps.get(index - 1) != Some(&Phase::Succeeded) {
            return Err(format!(
                "cannot start step {index}: predecessor has not succeeded"
            ));
        }
        let phase = self
            .steps
            .get_mut(index)
            .ok_or_else(|| format!("step index {index} out of range"))?;
        *phase = phase.advance(Phase::Running)?;
        Ok(())
    }

    pub fn finish_step(&mut self, index: usize, succeeded: bool) -> Result<(), String> {
        let next = if succeeded {
            Phase::Succeeded
        } else {
            Phase::Failed
        };
        let phase = self
            .steps
            .get_mut(index)
            .ok_or_else(|| format!("step index {index} out of range"))?;
        *phase = phase.advance(next)?;
        if !succeeded {
            self.run = self.run.advance(Phase::Failed)?;
        }
        Ok(())
    }

    /// Close a run whose steps all succeeded.
    pub fn finish_run(&mut self) -> Result<(), String> {
        if self.steps.iter().any(|phase| *phase != Phase::Succeeded) {
            return Err("cannot finish run: not every step succeeded".to_string());
        }
        self.run = self.run.advance(Phase::Succeeded)?;
        Ok(())
    }
}
