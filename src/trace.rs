use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::executor::{StepCounts, StepResult};
use crate::step::StepId;

#[derive(Debug, Clone)]
pub struct Trace {
    pub run_id: String,
    pub events: Vec<TraceEvent>,
    run_started_ms: u128,
    step_started_ms: HashMap<StepId, u128>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    RunStarted {
        ts_ms: u128,
        start_from: StepId,
        force: bool,
        subjects: usize,
    },
    StepStarted {
        ts_ms: u128,
        step: StepId,
    },
    SubjectFinished {
        ts_ms: u128,
        step: StepId,
        subject: String,
        status: String,
    },
    StepFinished {
        ts_ms: u128,
        step: StepId,
        counts: StepCounts,
        elapsed_ms: u128,
    },
    RunHalted {
        ts_ms: u128,
        step: StepId,
    },
    RunFinished {
        ts_ms: u128,
        success: bool,
        elapsed_ms: u128,
    },
}

impl TraceEvent {
    pub fn summarize(&self) -> String {
        match self {
            TraceEvent::RunStarted {
                ts_ms,
                start_from,
                force,
                subjects,
            } => format!(
                "{} RunStarted start_from={} force={force} subjects={subjects}",
                format_ts_ms(*ts_ms),
                start_from.ordinal()
            ),
            TraceEvent::StepStarted { ts_ms, step } => {
                format!("{} StepStarted step={}", format_ts_ms(*ts_ms), step.name())
            }
            TraceEvent::SubjectFinished {
                ts_ms,
                step,
                subject,
                status,
            } => format!(
                "{} SubjectFinished step={} subject={subject} status={status}",
                format_ts_ms(*ts_ms),
                step.name()
            ),
            TraceEvent::StepFinished {
                ts_ms,
                step,
                counts,
                elapsed_ms,
            } => format!(
                "{} StepFinished step={} skipped={} succeeded={} failed={} elapsed={}",
                format_ts_ms(*ts_ms),
                step.name(),
                counts.skipped,
                counts.succeeded,
                counts.failed,
                format_elapsed_ms(*elapsed_ms)
            ),
            TraceEvent::RunHalted { ts_ms, step } => {
                format!("{} RunHalted step={}", format_ts_ms(*ts_ms), step.name())
            }
            TraceEvent::RunFinished {
                ts_ms,
                success,
                elapsed_ms,
            } => format!(
                "{} RunFinished success={success} elapsed={}",
                format_ts_ms(*ts_ms),
                format_elapsed_ms(*elapsed_ms)
            ),
        }
    }
}

impl Trace {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Vec::new(),
            run_started_ms: Self::now_ms(),
            step_started_ms: HashMap::new(),
        }
    }

    fn now_ms() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }

    pub fn run_started(&mut self, start_from: StepId, force: bool, subjects: usize) {
        let ts_ms = Self::now_ms();
        self.run_started_ms = ts_ms;
        self.events.push(TraceEvent::RunStarted {
            ts_ms,
            start_from,
            force,
            subjects,
        });
    }

    pub fn step_started(&mut self, step: StepId) {
        let ts_ms = Self::now_ms();
        self.events.push(TraceEvent::StepStarted { ts_ms, step });
        self.step_started_ms.insert(step, ts_ms);
    }

    pub fn subject_finished(&mut self, result: &StepResult) {
        self.events.push(TraceEvent::SubjectFinished {
            ts_ms: Self::now_ms(),
            step: result.step,
            subject: result.subject.clone(),
            status: result.status.label().to_string(),
        });
    }

    pub fn step_finished(&mut self, step: StepId, counts: StepCounts) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = self
            .step_started_ms
            .remove(&step)
            .map(|started| ts_ms.saturating_sub(started))
            .unwrap_or(0);
        self.events.push(TraceEvent::StepFinished {
            ts_ms,
            step,
            counts,
            elapsed_ms,
        });
    }

    pub fn run_halted(&mut self, step: StepId) {
        self.events.push(TraceEvent::RunHalted {
            ts_ms: Self::now_ms(),
            step,
        });
    }

    pub fn run_finished(&mut self, success: bool) {
        let ts_ms = Self::now_ms();
        let elapsed_ms = ts_ms.saturating_sub(self.run_started_ms);
        self.events.push(TraceEvent::RunFinished {
            ts_ms,
            success,
            elapsed_ms,
        });
    }
}

/// Print a human-readable trace to stdout (stable + diff-friendly).
pub fn print_trace(tr: &Trace) {
    println!("TRACE run_id={}", tr.run_id);
    for ev in &tr.events {
        println!("{}", ev.summarize());
    }
}

fn format_ts_ms(ts_ms: u128) -> String {
    let secs = ts_ms / 1000;
    let millis = ts_ms % 1000;
    format!("{secs}.{millis:03}Z")
}

fn format_elapsed_ms(elapsed_ms: u128) -> String {
    let secs = elapsed_ms as f64 / 1000.0;
    format!("{secs:.2}s")
}
