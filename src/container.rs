//! Container invocation.
//!
//! [`ContainerCommand`] is a typed description of one run (image, mounts,
//! working directory, device flags). It is turned into an argument vector
//! only at the process boundary, so nothing is ever interpolated through a
//! shell and the exact invocation can be asserted on in tests.
//!
//! [`ContainerRuntimeAdapter`] maps a (step, subject) pair onto such a
//! command, hands it to a [`ContainerRuntime`], and normalizes the result.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, warn};

use crate::discovery::Subject;
use crate::error::ContainerError;
use crate::logfile::StepLog;
use crate::runtime::{ContainerRuntime, Engine};
use crate::step::{Access, Step};

pub const INPUT_MOUNT: &str = "/input";
pub const OUTPUT_MOUNT: &str = "/output";
pub const MASKS_MOUNT: &str = "/masks";

/// Exit codes the engines use when the entrypoint cannot be executed (126)
/// or found (127), typically because the working directory is wrong.
const ENTRYPOINT_EXIT_CODES: [i32; 2] = [126, 127];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    fn spec(&self) -> OsString {
        let mut s = OsString::from(self.host.as_os_str());
        s.push(":");
        s.push(&self.target);
        if self.read_only {
            s.push(":ro");
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    pub image: String,
    pub mounts: Vec<Mount>,
    pub workdir: Option<String>,
    pub gpu: bool,
    pub writable_tmpfs: bool,
    pub extra_args: Vec<String>,
}

impl ContainerCommand {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            mounts: Vec::new(),
            workdir: None,
            gpu: false,
            writable_tmpfs: false,
            extra_args: Vec::new(),
        }
    }

    pub fn mount(mut self, host: impl Into<PathBuf>, target: &str, read_only: bool) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            target: target.to_string(),
            read_only,
        });
        self
    }

    pub fn workdir(mut self, dir: Option<&str>) -> Self {
        self.workdir = dir.map(str::to_string);
        self
    }

    pub fn gpu(mut self, enabled: bool) -> Self {
        self.gpu = enabled;
        self
    }

    pub fn writable_tmpfs(mut self, enabled: bool) -> Self {
        self.writable_tmpfs = enabled;
        self
    }

    pub fn extra_args(mut self, args: &[String]) -> Self {
        self.extra_args.extend(args.iter().cloned());
        self
    }

    /// The engine's argument vector (program name excluded).
    pub fn to_args(&self, engine: Engine) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match engine {
            Engine::Docker => {
                args.extend(["run", "--rm"].map(OsString::from));
                if self.gpu {
                    args.extend(["--gpus", "all"].map(OsString::from));
                }
                for m in &self.mounts {
                    args.push("-v".into());
                    args.push(m.spec());
                }
                if let Some(dir) = &self.workdir {
                    args.push("-w".into());
                    args.push(dir.into());
                }
                args.extend(self.extra_args.iter().map(OsString::from));
                args.push(self.image.as_str().into());
            }
            Engine::Apptainer | Engine::Singularity => {
                args.push("run".into());
                if self.gpu {
                    args.push("--nv".into());
                }
                if self.writable_tmpfs {
                    args.push("--writable-tmpfs".into());
                }
                if let Some(dir) = &self.workdir {
                    args.push("--pwd".into());
                    args.push(dir.into());
                }
                for m in &self.mounts {
                    args.push("--bind".into());
                    args.push(m.spec());
                }
                args.extend(self.extra_args.iter().map(OsString::from));
                args.push(format!("docker://{}", self.image).into());
            }
        }
        args
    }
}

/// Normalized result of one successful container run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub duration_ms: u128,
    pub log_path: PathBuf,
}

pub struct ContainerRuntimeAdapter {
    runtime: Box<dyn ContainerRuntime>,
    gpu_enabled: bool,
    prepared_images: RefCell<BTreeSet<String>>,
}

impl ContainerRuntimeAdapter {
    /// `gpu_enabled` is the cached host capability, decided once per run.
    pub fn new(runtime: Box<dyn ContainerRuntime>, gpu_enabled: bool) -> Self {
        Self {
            runtime,
            gpu_enabled,
            prepared_images: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn engine(&self) -> Engine {
        self.runtime.engine()
    }

    pub fn gpu_enabled(&self) -> bool {
        self.gpu_enabled
    }

    /// The command that [`ContainerRuntimeAdapter::run`] would execute.
    /// `None` for steps without an image.
    pub fn command_for(
        &self,
        step: &Step,
        subject: &str,
        extra_flags: &[String],
    ) -> Option<ContainerCommand> {
        let image = step.image.as_deref()?;
        let mut cmd = ContainerCommand::new(image)
            .mount(step.subject_input(subject), INPUT_MOUNT, true)
            .mount(step.subject_output(subject), OUTPUT_MOUNT, false);
        if let (Some(masks), Some(dir)) = (&step.masks, step.subject_masks(subject)) {
            cmd = cmd.mount(dir, MASKS_MOUNT, masks.access == Access::ReadOnly);
        }
        Some(
            cmd.workdir(step.workdir.as_deref())
                .gpu(step.gpu && self.gpu_enabled)
                .writable_tmpfs(step.writable_tmpfs)
                .extra_args(extra_flags),
        )
    }

    /// Execute `step` for `subject`. Non-zero exits become errors; a zero exit
    /// says nothing yet about the produced files.
    pub fn run(
        &self,
        step: &Step,
        subject: &Subject,
        extra_flags: &[String],
        log: &StepLog,
    ) -> Result<RunOutcome, ContainerError> {
        let cmd = self
            .command_for(step, &subject.id, extra_flags)
            .ok_or(ContainerError::NoImage(step.name()))?;

        for m in &cmd.mounts {
            if m.host.to_string_lossy().contains(':') {
                return Err(ContainerError::InvalidMount(m.host.clone()));
            }
        }

        create_dir(&step.subject_output(&subject.id))?;
        if let (Some(masks), Some(dir)) = (&step.masks, step.subject_masks(&subject.id)) {
            if masks.access == Access::ReadWrite {
                create_dir(&dir)?;
            }
        }

        self.ensure_image(&cmd.image, log);

        let started = Instant::now();
        let code = self.runtime.invoke(&cmd, log)?;
        let duration_ms = started.elapsed().as_millis();
        debug!(
            step = step.name(),
            subject = %subject.id,
            "container finished: exit={code:?} after {duration_ms}ms"
        );

        match code {
            Some(0) => Ok(RunOutcome {
                exit_code: 0,
                duration_ms,
                log_path: log.path().to_path_buf(),
            }),
            Some(c) if ENTRYPOINT_EXIT_CODES.contains(&c) => Err(ContainerError::Entrypoint {
                exit_code: c,
                workdir: cmd
                    .workdir
                    .clone()
                    .unwrap_or_else(|| "<image default>".to_string()),
            }),
            Some(c) => Err(ContainerError::Execution(c)),
            None => Err(ContainerError::Terminated),
        }
    }

    /// Pull each image at most once per run. A failed pull is only a warning;
    /// the run that follows reports the real failure.
    fn ensure_image(&self, image: &str, log: &StepLog) {
        if self.prepared_images.borrow().contains(image) {
            return;
        }
        if let Err(err) = self.runtime.prepare_image(image, log) {
            warn!("could not prepare image {image}: {err}");
        }
        self.prepared_images.borrow_mut().insert(image.to_string());
    }
}

fn create_dir(dir: &Path) -> Result<(), ContainerError> {
    fs::create_dir_all(dir).map_err(|source| ContainerError::Io {
        context: format!("failed to create '{}'", dir.display()),
        source,
    })
}
