//! Pipeline state machine.
//!
//! `Pending -> Running(k) -> Running(k+1) | Halted(k)`, ending in `Completed`
//! or `Halted(k)`. Steps run in fixed order from `start_from`; the first step
//! with any failed subject halts the run.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::checkpoint::OutputDirCheckpoint;
use crate::config::PipelineConfig;
use crate::container::ContainerRuntimeAdapter;
use crate::discovery::{discover_subjects, Subject};
use crate::error::ConfigError;
use crate::executor::{ExecuteStep, StepCounts, StepExecutor, StepResult};
use crate::step::{catalog, Step, StepId};
use crate::trace::Trace;
use crate::volumes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub start_from: StepId,
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start_from: StepId::PrepareData,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running(StepId),
    Halted(StepId),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "step", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed,
    HaltedAtStep(StepId),
}

/// Everything one executed step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRun {
    pub step: StepId,
    pub counts: StepCounts,
    pub results: Vec<StepResult>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    pub outcome: PipelineOutcome,
    pub steps: Vec<StepRun>,
    pub duration: Duration,
    pub volume_table: Option<PathBuf>,
}

impl PipelineRun {
    pub fn success(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }

    pub fn attempted(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.step).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps
            .iter()
            .flat_map(|s| s.results.iter())
            .filter(|r| r.is_failed())
    }
}

pub struct PipelineOrchestrator<E: ExecuteStep> {
    executor: E,
    state: RunState,
    trace: Trace,
}

impl<E: ExecuteStep> PipelineOrchestrator<E> {
    pub fn new(executor: E) -> Self {
        let run_id = format!("run-{}", Local::now().format("%Y%m%d_%H%M%S"));
        Self {
            executor,
            state: RunState::Pending,
            trace: Trace::new(run_id),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    /// Drive `steps` (the full catalog, in order) over `subjects`.
    pub fn run(&mut self, steps: &[Step], subjects: &[Subject], options: RunOptions) -> PipelineRun {
        let started = Instant::now();
        self.trace
            .run_started(options.start_from, options.force, subjects.len());

        let mut runs = Vec::new();
        let mut outcome = PipelineOutcome::Completed;

        for step in steps.iter().filter(|s| s.id >= options.start_from) {
            self.state = RunState::Running(step.id);
            self.trace.step_started(step.id);
            info!("starting {} ({})", step.id, step.id.title());

            let step_started = Instant::now();
            let results = self.executor.execute(step, subjects, options.force);
            let counts = StepCounts::tally(&results);
            for r in &results {
                self.trace.subject_finished(r);
            }
            self.trace.step_finished(step.id, counts);
            info!(
                "{} finished: skipped={} succeeded={} failed={}",
                step.id, counts.skipped, counts.succeeded, counts.failed
            );

            runs.push(StepRun {
                step: step.id,
                counts,
                results,
                duration: step_started.elapsed(),
            });

            if counts.failed > 0 {
                error!("{} failed for {} subject(s); halting", step.id, counts.failed);
                self.state = RunState::Halted(step.id);
                self.trace.run_halted(step.id);
                outcome = PipelineOutcome::HaltedAtStep(step.id);
                break;
            }
        }

        if outcome == PipelineOutcome::Completed {
            self.state = RunState::Completed;
        }
        self.trace.run_finished(outcome == PipelineOutcome::Completed);

        PipelineRun {
            outcome,
            steps: runs,
            duration: started.elapsed(),
            volume_table: None,
        }
    }
}

/// Discover subjects and run the pipeline against real directories.
///
/// Only configuration problems are returned as errors; a halted run is a
/// normal [`PipelineRun`].
pub fn run_pipeline(
    config: &PipelineConfig,
    adapter: &ContainerRuntimeAdapter,
    options: RunOptions,
) -> Result<(PipelineRun, Trace), ConfigError> {
    let subjects = discover_subjects(&config.input_dir)?;
    let steps = catalog(config);
    info!(
        "container runtime: {}, GPU acceleration: {}",
        adapter.engine(),
        if adapter.gpu_enabled() { "enabled" } else { "disabled" }
    );

    let checkpoint = OutputDirCheckpoint;
    let executor = StepExecutor::new(adapter, &checkpoint, &config.logs_dir)
        .with_extra_flags(config.container_args.clone());

    let mut orchestrator = PipelineOrchestrator::new(executor);
    let mut run = orchestrator.run(&steps, &subjects, options);

    if run.success() && run.attempted().contains(&StepId::SegmentTubers) {
        let ids: Vec<&str> = subjects.iter().map(|s| s.id.as_str()).collect();
        match volumes::aggregate_volume_results(&config.results_dir, &ids) {
            Ok(table) => run.volume_table = table,
            Err(err) => warn!("failed to aggregate volume results: {err}"),
        }
    }

    Ok((run, orchestrator.into_trace()))
}
