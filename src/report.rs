//! Final run report: a human summary for stdout and an optional JSON file.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::executor::StepCounts;
use crate::orchestrator::{PipelineOutcome, PipelineRun};
use crate::step::StepId;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub outcome: PipelineOutcome,
    pub exit_code: i32,
    pub duration_secs: f64,
    pub steps: Vec<StepReport>,
    pub failures: Vec<FailureReport>,
    pub notes: Vec<NoteReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_table: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: StepId,
    pub ordinal: u8,
    #[serde(flatten)]
    pub counts: StepCounts,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub step: StepId,
    pub subject: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteReport {
    pub step: StepId,
    pub subject: String,
    pub note: String,
}

impl PipelineReport {
    pub fn from_run(run: &PipelineRun) -> Self {
        let steps = run
            .steps
            .iter()
            .map(|s| StepReport {
                step: s.step,
                ordinal: s.step.ordinal(),
                counts: s.counts,
                duration_secs: s.duration.as_secs_f64(),
            })
            .collect();

        let failures = run
            .failures()
            .filter_map(|r| {
                r.failure().map(|reason| FailureReport {
                    step: r.step,
                    subject: r.subject.clone(),
                    reason: reason.to_string(),
                })
            })
            .collect();

        let notes = run
            .steps
            .iter()
            .flat_map(|s| s.results.iter())
            .filter_map(|r| {
                r.note.as_ref().map(|note| NoteReport {
                    step: r.step,
                    subject: r.subject.clone(),
                    note: note.clone(),
                })
            })
            .collect();

        Self {
            outcome: run.outcome,
            exit_code: if run.success() { 0 } else { 1 },
            duration_secs: run.duration.as_secs_f64(),
            steps,
            failures,
            notes,
            volume_table: run.volume_table.clone(),
        }
    }

    /// Stable, line-oriented summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = match self.outcome {
            PipelineOutcome::Completed => "COMPLETED".to_string(),
            PipelineOutcome::HaltedAtStep(step) => format!("HALTED at {step}"),
        };
        let _ = writeln!(out, "PIPELINE {status} in {:.1}s", self.duration_secs);
        for s in &self.steps {
            let _ = writeln!(
                out,
                "  step {} {:<16} skipped={} succeeded={} failed={} ({:.1}s)",
                s.ordinal,
                s.step.name(),
                s.counts.skipped,
                s.counts.succeeded,
                s.counts.failed,
                s.duration_secs
            );
        }
        if !self.failures.is_empty() {
            let _ = writeln!(out, "FAILED SUBJECTS:");
            for f in &self.failures {
                let _ = writeln!(out, "  {} [{}]: {}", f.subject, f.step.name(), f.reason);
            }
        }
        for n in &self.notes {
            let _ = writeln!(out, "NOTE {} [{}]: {}", n.subject, n.step.name(), n.note);
        }
        if let Some(table) = &self.volume_table {
            let _ = writeln!(out, "Volume results: {}", table.display());
        }
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        fs::write(path, json + "\n")
            .with_context(|| format!("failed to write report '{}'", path.display()))
    }
}
