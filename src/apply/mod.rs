//! Application of generated artifacts to a sandbox session.

pub mod engine;
pub mod run;

pub use engine::{ApplicationEngine, EngineSettings};
pub use run::{
    ApplicationRun, ApplyBatch, InstallOutcome, InvalidTransition, ProgressSnapshot, RunStage,
    RunStatus, dedup_artifacts,
};
