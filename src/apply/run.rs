use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::FileArtifact;

/// Stage of an [`ApplicationRun`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Analyzing,
    Installing,
    Writing,
    Restarting,
    Complete,
    Failed { at: String, reason: String },
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::Analyzing => "analyzing",
            RunStage::Installing => "installing",
            RunStage::Writing => "writing",
            RunStage::Restarting => "restarting",
            RunStage::Complete => "complete",
            RunStage::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Complete | RunStage::Failed { .. })
    }

    pub fn can_transition_to(&self, next: &RunStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, RunStage::Failed { .. }) => true,
            (RunStage::Idle, RunStage::Analyzing) => true,
            (RunStage::Analyzing, RunStage::Installing | RunStage::Writing | RunStage::Complete) => {
                true
            }
            (RunStage::Installing, RunStage::Writing) => true,
            (RunStage::Writing, RunStage::Restarting | RunStage::Complete) => true,
            (RunStage::Restarting, RunStage::Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStage::Failed { at, reason } => write!(f, "failed during {at}: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

/// Overall result of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Some files applied, some failed
    Partial,
    /// Nothing applied and at least one failure, or the run aborted
    Failed,
    /// Empty batch
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub packages: Vec<String>,
    pub manifests: Vec<String>,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// What a run reports to the UI on every stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub session_id: String,
    pub stage: RunStage,
    pub applied_paths: Vec<String>,
    pub failed_paths: BTreeMap<String, String>,
}

/// One pass of applying a batch of artifacts to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRun {
    pub id: String,
    pub session_id: String,
    pub stage: RunStage,
    /// In write order
    pub applied_paths: Vec<String>,
    /// path -> reason
    pub failed_paths: BTreeMap<String, String>,
    pub install: Option<InstallOutcome>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ApplicationRun {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            stage: RunStage::Idle,
            applied_paths: Vec::new(),
            failed_paths: BTreeMap::new(),
            install: None,
            warnings: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn advance(&mut self, next: RunStage) -> Result<(), InvalidTransition> {
        if !self.stage.can_transition_to(&next) {
            return Err(InvalidTransition {
                from: self.stage.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.stage = next;
        Ok(())
    }

    /// Move to `Failed`, remembering the stage the run was in.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.stage.is_terminal() {
            return;
        }
        self.stage = RunStage::Failed {
            at: self.stage.as_str().to_string(),
            reason: reason.into(),
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn status(&self) -> RunStatus {
        if matches!(self.stage, RunStage::Failed { .. }) {
            return RunStatus::Failed;
        }
        match (self.applied_paths.is_empty(), self.failed_paths.is_empty()) {
            (true, true) => RunStatus::NoChanges,
            (true, false) => RunStatus::Failed,
            (false, false) => RunStatus::Partial,
            (false, true) => RunStatus::Succeeded,
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id: self.id.clone(),
            session_id: self.session_id.clone(),
            stage: self.stage.clone(),
            applied_paths: self.applied_paths.clone(),
            failed_paths: self.failed_paths.clone(),
        }
    }
}

/// Artifacts and package requests collected from one generation stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyBatch {
    pub artifacts: Vec<FileArtifact>,
    pub packages: Vec<String>,
}

impl ApplyBatch {
    pub fn new(artifacts: Vec<FileArtifact>) -> Self {
        Self {
            artifacts,
            packages: Vec::new(),
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.packages.is_empty()
    }
}

/// Keep the last artifact for each path. Paths that occur once keep their
/// order; superseded paths follow them, ordered by their last occurrence.
pub fn dedup_artifacts(artifacts: Vec<FileArtifact>) -> Vec<FileArtifact> {
    // path -> (occurrences, index of the last one)
    let mut seen: HashMap<String, (usize, usize)> = HashMap::new();
    for (idx, artifact) in artifacts.iter().enumerate() {
        let entry = seen.entry(artifact.path.clone()).or_insert((0, idx));
        entry.0 += 1;
        entry.1 = idx;
    }
    let (distinct, superseded): (Vec<FileArtifact>, Vec<FileArtifact>) = artifacts
        .into_iter()
        .enumerate()
        .filter(|(idx, artifact)| seen[&artifact.path].1 == *idx)
        .map(|(_, artifact)| artifact)
        .partition(|artifact| seen[&artifact.path].0 == 1);
    distinct.into_iter().chain(superseded).collect()
}
