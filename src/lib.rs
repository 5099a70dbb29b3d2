//! Orchestrator for the five-stage TSC tuber segmentation pipeline.
//!
//! The imaging work itself happens inside opaque container images. This crate
//! discovers subjects (`discovery`), decides what still needs doing
//! (`checkpoint`), runs each step across all subjects with per-subject failure
//! isolation (`executor`, `container`, `runtime`), and halts the run at the
//! first step with any failed subject (`orchestrator`).
//!
//! Invariants:
//! - subjects are always processed in lexicographic order, one at a time
//! - a failed subject never prevents the other subjects of the same step from running
//! - no step after a failed step is attempted in the same run
//! - a zero exit code without qualifying output files is a failure

pub mod capabilities;
pub mod checkpoint;
pub mod config;
pub mod container;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod logfile;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod runtime;
pub mod staging;
pub mod step;
pub mod trace;
pub mod volumes;
