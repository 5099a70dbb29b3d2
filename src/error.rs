//! Error taxonomy for the orchestration core.
//!
//! Only [`ConfigError`] ever stops a run before orchestration begins. Every
//! other class is contained per subject and travels inside a
//! [`SubjectFailure`] attached to a failed step result.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::discovery::Modality;

/// Fatal problems detected before any step executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("project root not found: '{}'", .0.display())]
    ProjectRootMissing(PathBuf),

    #[error("input directory not found: '{}'", .0.display())]
    InputRootMissing(PathBuf),

    #[error("no subject directories found in '{}'", .0.display())]
    NoSubjects(PathBuf),

    #[error("no container runtime available (tried {tried}); need Docker, Apptainer or Singularity")]
    RuntimeUnavailable { tried: String },

    #[error("invalid {var}: '{value}' (expected {expected})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid start step {0} (must be 0..4)")]
    InvalidStartStep(u8),

    #[error("failed to read settings file '{}'", path.display())]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings file '{}'", path.display())]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to prepare directory '{}'", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A subject that does not satisfy the input naming/modality contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing modality: {}", join_modalities(.0))]
    MissingModalities(Vec<Modality>),
}

fn join_modalities(missing: &[Modality]) -> String {
    missing
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures of one external container invocation.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container exited with code {0}")]
    Execution(i32),

    #[error("container terminated by signal")]
    Terminated,

    #[error("container entrypoint could not be resolved (exit {exit_code}, workdir {workdir})")]
    Entrypoint { exit_code: i32, workdir: String },

    #[error("step '{0}' has no container image")]
    NoImage(&'static str),

    #[error("mount source contains ':' and cannot be passed to the engine: '{}'", .0.display())]
    InvalidMount(PathBuf),

    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("container I/O failed: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// The external tool exited zero but left nothing that qualifies as output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no qualifying output ({pattern}) in '{}'", dir.display())]
pub struct OutputValidationError {
    pub dir: PathBuf,
    pub pattern: String,
}

/// Why a (subject, step) pair failed. Cloneable so results stay immutable values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("missing input: '{}' is absent or empty", .0.display())]
    MissingInput(PathBuf),

    #[error("container execution failed: {0}")]
    ContainerExecution(String),

    #[error("container entrypoint error: {0}")]
    ContainerEntrypoint(String),

    #[error(transparent)]
    OutputValidation(#[from] OutputValidationError),

    #[error("staging failed: {0}")]
    Staging(String),
}

impl From<ContainerError> for SubjectFailure {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Entrypoint { .. } => SubjectFailure::ContainerEntrypoint(err.to_string()),
            other => SubjectFailure::ContainerExecution(format_chain(&other)),
        }
    }
}

/// Render an error with its source chain on one line.
pub fn format_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(cause) = cur {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        cur = cause.source();
    }
    out
}
