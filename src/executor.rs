//! Runs one step across every subject.
//!
//! Per-subject failures are contained here: [`ExecuteStep::execute`] always
//! returns exactly one [`StepResult`] per subject, in input order, and never
//! returns an error. Interpreting the aggregate is the orchestrator's job.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::checkpoint::{dir_has_entries, CheckpointPolicy};
use crate::container::ContainerRuntimeAdapter;
use crate::discovery::Subject;
use crate::error::{ContainerError, OutputValidationError, SubjectFailure};
use crate::logfile::StepLog;
use crate::staging;
use crate::step::{OutputPattern, Step, StepId};

/// Exit code of a container killed for exceeding its memory limit.
const OUT_OF_MEMORY_EXIT: i32 = 137;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Skipped,
    Succeeded,
    Failed(SubjectFailure),
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Skipped => "skipped",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Outcome of one (subject, step) pair. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    pub subject: String,
    pub step: StepId,
    pub status: StepStatus,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
    /// Set when the step succeeded through a fallback path.
    pub note: Option<String>,
}

impl StepResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StepStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<&SubjectFailure> {
        match &self.status {
            StepStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Per-step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StepCounts {
    pub fn tally(results: &[StepResult]) -> Self {
        let mut counts = Self::default();
        for r in results {
            match r.status {
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Succeeded => counts.succeeded += 1,
                StepStatus::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }
}

pub trait ExecuteStep {
    fn execute(&self, step: &Step, subjects: &[Subject], force: bool) -> Vec<StepResult>;
}

impl<E: ExecuteStep + ?Sized> ExecuteStep for &E {
    fn execute(&self, step: &Step, subjects: &[Subject], force: bool) -> Vec<StepResult> {
        (**self).execute(step, subjects, force)
    }
}

pub struct StepExecutor<'a> {
    adapter: &'a ContainerRuntimeAdapter,
    checkpoint: &'a dyn CheckpointPolicy,
    logs_dir: PathBuf,
    extra_flags: Vec<String>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        adapter: &'a ContainerRuntimeAdapter,
        checkpoint: &'a dyn CheckpointPolicy,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            adapter,
            checkpoint,
            logs_dir: logs_dir.into(),
            extra_flags: Vec::new(),
        }
    }

    /// Flags appended to every container run.
    pub fn with_extra_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }

    fn execute_subject(&self, step: &Step, subject: &Subject, force: bool, log: &StepLog) -> StepResult {
        let started = Instant::now();
        log_line(log, format!("--- {} ---", subject.id));

        let (status, note) = match self.eligibility(step, subject) {
            Err(failure) => (StepStatus::Failed(failure), None),
            Ok(()) if self.checkpoint.should_skip(step, subject, force) => {
                (StepStatus::Skipped, None)
            }
            Ok(()) => match self.perform(step, subject, log) {
                Ok(note) => (StepStatus::Succeeded, note),
                Err(failure) => (StepStatus::Failed(failure), None),
            },
        };

        let result = StepResult {
            subject: subject.id.clone(),
            step: step.id,
            status,
            duration: started.elapsed(),
            log_path: Some(log.path().to_path_buf()),
            note,
        };
        report_outcome(&result, log);
        result
    }

    /// Preconditions that make an attempt pointless.
    fn eligibility(&self, step: &Step, subject: &Subject) -> Result<(), SubjectFailure> {
        if step.id == StepId::PrepareData {
            return match subject.validation_error() {
                Some(err) => Err(err.clone().into()),
                None => Ok(()),
            };
        }
        let input = step.subject_input(&subject.id);
        if dir_has_entries(&input) {
            Ok(())
        } else {
            Err(SubjectFailure::MissingInput(input))
        }
    }

    /// Produce the step's output for one subject and check that it appeared.
    fn perform(
        &self,
        step: &Step,
        subject: &Subject,
        log: &StepLog,
    ) -> Result<Option<String>, SubjectFailure> {
        let output = step.subject_output(&subject.id);
        let before = snapshot(&output, step.expected_output);

        let note = match step.id {
            StepId::PrepareData => {
                let staged = staging::stage_files(subject.accepted_files(), &output)
                    .map_err(|e| SubjectFailure::Staging(e.to_string()))?;
                log_line(log, format!("staged {staged} file(s) into '{}'", output.display()));
                None
            }
            StepId::CombineT2 => self.combine_t2(step, subject, log)?,
            _ => {
                self.adapter.run(step, subject, &self.extra_flags, log)?;
                None
            }
        };

        let after = snapshot(&output, step.expected_output);
        if count_new_or_changed(&before, &after) == 0 {
            return Err(OutputValidationError {
                dir: output,
                pattern: step.expected_output.to_string(),
            }
            .into());
        }
        Ok(note)
    }

    /// Only subjects with several T2 sequences need the combination container;
    /// the rest pass through unchanged.
    fn combine_t2(
        &self,
        step: &Step,
        subject: &Subject,
        log: &StepLog,
    ) -> Result<Option<String>, SubjectFailure> {
        let input = step.subject_input(&subject.id);
        let output = step.subject_output(&subject.id);
        let staging_failed = |e: std::io::Error| SubjectFailure::Staging(e.to_string());

        let t2 = staging::count_t2(&input).map_err(staging_failed)?;
        if t2 <= 1 {
            let copied = staging::copy_nifti(&input, &output).map_err(staging_failed)?;
            log_line(log, format!("single T2 sequence, copied {copied} file(s)"));
            return Ok(None);
        }

        match self.adapter.run(step, subject, &self.extra_flags, log) {
            Ok(_) => Ok(None),
            Err(ContainerError::Execution(OUT_OF_MEMORY_EXIT)) => {
                let chosen = staging::single_t2_substitution(&input, &output)
                    .map_err(staging_failed)?;
                let name = chosen
                    .as_deref()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let note = format!(
                    "T2 combination ran out of memory (exit {OUT_OF_MEMORY_EXIT}); using single T2 file '{name}'"
                );
                warn!(subject = %subject.id, step = step.name(), "{note}");
                log_line(log, format!("WARNING {note}"));
                Ok(Some(note))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ExecuteStep for StepExecutor<'_> {
    fn execute(&self, step: &Step, subjects: &[Subject], force: bool) -> Vec<StepResult> {
        let log = StepLog::new(&self.logs_dir, step.name(), Local::now());
        info!("{}: {} subject(s), log '{}'", step.id, subjects.len(), log.path().display());
        log_line(
            &log,
            format!("{} ({}) force={force}", step.id, step.id.title()),
        );

        let results: Vec<StepResult> = subjects
            .iter()
            .map(|subject| self.execute_subject(step, subject, force, &log))
            .collect();

        let counts = StepCounts::tally(&results);
        log_line(
            &log,
            format!(
                "summary: skipped={} succeeded={} failed={}",
                counts.skipped, counts.succeeded, counts.failed
            ),
        );
        results
    }
}

fn report_outcome(result: &StepResult, log: &StepLog) {
    let secs = result.duration.as_secs_f64();
    match &result.status {
        StepStatus::Failed(reason) => {
            error!(subject = %result.subject, step = result.step.name(), "failed: {reason}");
            log_line(log, format!("{} FAILED ({secs:.1}s): {reason}", result.subject));
        }
        status => {
            info!(subject = %result.subject, step = result.step.name(), "{status}");
            log_line(log, format!("{} {} ({secs:.1}s)", result.subject, status.label()));
        }
    }
}

fn log_line(log: &StepLog, message: impl fmt::Display) {
    if let Err(err) = log.line(message) {
        warn!("failed to write step log '{}': {err}", log.path().display());
    }
}

type Snapshot = BTreeMap<PathBuf, (u64, Option<SystemTime>)>;

/// Size and mtime of every file in `dir` that matches `pattern`.
fn snapshot(dir: &Path, pattern: OutputPattern) -> Snapshot {
    let mut out = Snapshot::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !pattern.matches(name) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                out.insert(path, (meta.len(), meta.modified().ok()));
            }
        }
    }
    out
}

fn count_new_or_changed(before: &Snapshot, after: &Snapshot) -> usize {
    after
        .iter()
        .filter(|(path, stamp)| before.get(*path) != Some(*stamp))
        .count()
}
