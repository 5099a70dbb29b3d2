//! One-shot host capability probes, run at startup before any step.

use std::process::{Command, Stdio};

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::config::GpuMode;
use crate::error::ConfigError;
use crate::runtime::Engine;

static NVIDIA_GPU: OnceCell<bool> = OnceCell::new();

/// Whether GPU steps should be given GPU devices. `auto` probes at most once per process.
pub fn gpu_enabled(mode: GpuMode) -> bool {
    match mode {
        GpuMode::On => true,
        GpuMode::Off => false,
        GpuMode::Auto => *NVIDIA_GPU.get_or_init(|| {
            let present = probe("nvidia-smi", &[]);
            debug!("nvidia-smi probe: {present}");
            present
        }),
    }
}

/// Pick the container engine, or fail the run before anything executes.
pub fn detect_engine(forced: Option<Engine>) -> Result<Engine, ConfigError> {
    let candidates: Vec<Engine> = match forced {
        Some(e) => vec![e],
        None => Engine::ALL.to_vec(),
    };

    for engine in &candidates {
        if probe(engine.binary(), engine.probe_args()) {
            info!("container runtime: {engine}");
            return Ok(*engine);
        }
        debug!("container runtime '{engine}' unavailable");
    }

    Err(ConfigError::RuntimeUnavailable {
        tried: candidates
            .iter()
            .map(|e| e.binary())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// True iff `program args…` can be spawned and exits zero.
fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
