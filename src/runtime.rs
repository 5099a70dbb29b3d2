use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;

use tracing::{debug, info, warn};

use crate::container::ContainerCommand;
use crate::error::ContainerError;
use crate::logfile::StepLog;

/// Supported container engines, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Docker,
    Apptainer,
    Singularity,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::Docker, Engine::Apptainer, Engine::Singularity];

    pub fn binary(self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Apptainer => "apptainer",
            Engine::Singularity => "singularity",
        }
    }

    /// Arguments of a cheap command that only succeeds when the engine is usable.
    /// For Docker this also proves the daemon is reachable.
    pub fn probe_args(self) -> &'static [&'static str] {
        match self {
            Engine::Docker => &["ps"],
            Engine::Apptainer | Engine::Singularity => &["--version"],
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Engine::Docker),
            "apptainer" => Ok(Engine::Apptainer),
            "singularity" => Ok(Engine::Singularity),
            other => Err(format!("unknown container engine '{other}'")),
        }
    }
}

/// Process-isolation backend. Injected so tests can run without an engine.
pub trait ContainerRuntime {
    fn engine(&self) -> Engine;

    /// Make `image` available locally. Output goes to `log`.
    fn prepare_image(&self, image: &str, log: &StepLog) -> Result<(), ContainerError>;

    /// Run one container to completion; returns the exit code, `None` if killed by a signal.
    /// All stdout/stderr is appended verbatim to `log`.
    fn invoke(&self, command: &ContainerCommand, log: &StepLog)
        -> Result<Option<i32>, ContainerError>;
}

/// Runs the engine CLI as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    engine: Engine,
}

impl ProcessRuntime {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    fn command(&self) -> Command {
        Command::new(self.engine.binary())
    }
}

impl ContainerRuntime for ProcessRuntime {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn prepare_image(&self, image: &str, log: &StepLog) -> Result<(), ContainerError> {
        if self.engine != Engine::Docker {
            // Apptainer/Singularity pull docker:// images on first run.
            info!("{} will pull docker://{image} on first use if needed", self.engine);
            return Ok(());
        }

        let mut inspect = self.command();
        inspect.args(["image", "inspect", image]);
        if let Some(0) = run_captured(inspect, None)? {
            debug!("image already available locally: {image}");
            return Ok(());
        }

        info!("pulling image {image} (this may take several minutes)");
        let mut pull = self.command();
        pull.args(["pull", image]);
        match run_captured(pull, Some(log))? {
            Some(0) => Ok(()),
            Some(code) => Err(ContainerError::Execution(code)),
            None => Err(ContainerError::Terminated),
        }
    }

    fn invoke(
        &self,
        command: &ContainerCommand,
        log: &StepLog,
    ) -> Result<Option<i32>, ContainerError> {
        let args = command.to_args(self.engine);
        let rendered = render_command(self.engine.binary(), &args);
        debug!("executing: {rendered}");
        if let Err(err) = log.line(format!("$ {rendered}")) {
            warn!("failed to write step log '{}': {err}", log.path().display());
        }

        let mut cmd = self.command();
        cmd.args(&args);
        run_captured(cmd, Some(log))
    }
}

/// Spawn `cmd`, drain both pipes, wait, and append the output to `log`.
fn run_captured(mut cmd: Command, log: Option<&StepLog>) -> Result<Option<i32>, ContainerError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ContainerError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or_else(|| io_error(&program, "stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| io_error(&program, "stderr"))?;

    // Drain stdout/stderr concurrently to avoid deadlock if the child fills pipe buffers.
    let out_handle = thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut r = stdout;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Ok(buf)
    });
    let err_handle = thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut r = stderr;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Ok(buf)
    });

    let status = child.wait().map_err(|source| ContainerError::Io {
        context: format!("failed waiting for '{program}'"),
        source,
    })?;

    let out_buf = join_reader(out_handle, &program, "stdout")?;
    let err_buf = join_reader(err_handle, &program, "stderr")?;

    if let Some(log) = log {
        let appended = log
            .append(&out_buf)
            .and_then(|_| log.append(&err_buf));
        if let Err(err) = appended {
            warn!("failed to append output to '{}': {err}", log.path().display());
        }
    }

    Ok(status.code())
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<Vec<u8>>>,
    program: &str,
    stream: &str,
) -> Result<Vec<u8>, ContainerError> {
    handle
        .join()
        .map_err(|_| io_error(program, stream))?
        .map_err(|source| ContainerError::Io {
            context: format!("failed reading {stream} of '{program}'"),
            source,
        })
}

fn io_error(program: &str, stream: &str) -> ContainerError {
    ContainerError::Io {
        context: format!("{stream} of '{program}' unavailable"),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reader failed"),
    }
}

fn render_command(program: &str, args: &[OsString]) -> String {
    let mut out = program.to_string();
    for a in args {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    out
}
