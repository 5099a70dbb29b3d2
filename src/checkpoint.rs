//! Structural checkpoints.
//!
//! A (subject, step) is considered done when its output directory exists and
//! holds at least one entry. File contents are never inspected, so a directory
//! left half-written by a killed container also counts as done until the run
//! is repeated with `force`.

use std::fs;
use std::path::Path;

use crate::discovery::Subject;
use crate::step::Step;

pub trait CheckpointPolicy {
    fn should_skip(&self, step: &Step, subject: &Subject, force: bool) -> bool;
}

/// Existence-based policy: skip iff not forced and the output dir is non-empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputDirCheckpoint;

impl CheckpointPolicy for OutputDirCheckpoint {
    fn should_skip(&self, step: &Step, subject: &Subject, force: bool) -> bool {
        !force && dir_has_entries(&step.subject_output(&subject.id))
    }
}

/// True iff `dir` exists, is readable, and contains at least one entry.
pub fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
