#![allow(dead_code)]

use std::cell::RefCell;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tuber_pipeline::container::{ContainerCommand, INPUT_MOUNT, MASKS_MOUNT, OUTPUT_MOUNT};
use tuber_pipeline::error::ContainerError;
use tuber_pipeline::logfile::StepLog;
use tuber_pipeline::runtime::{ContainerRuntime, Engine};
use tuber_pipeline::step::{is_nifti, SEGMENT_TUBERS_IMAGE};
use tuber_pipeline::volumes::{VOLUME_FILE_NAME, VOLUME_HEADER};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation.
///
/// All mutations through this guard are serialized with a global lock.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);

        // Env mutation is unsafe on recent toolchains; ENV_LOCK serializes it.
        unsafe {
            env::set_var(&key, value);
        }

        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.old {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }
}

/// Fresh directory under the system temp dir, unique per call.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = env::temp_dir().join(format!(
        "tuber-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Create `input_root/<id>/` holding one empty file per name.
pub fn write_subject(input_root: &Path, id: &str, names: &[&str]) -> PathBuf {
    let dir = input_root.join(id);
    fs::create_dir_all(&dir).unwrap();
    for name in names {
        fs::write(dir.join(name), format!("{name}\n")).unwrap();
    }
    dir
}

/// The usual T1 + axial T2 + FLAIR bundle.
pub fn write_valid_subject(input_root: &Path, id: &str) -> PathBuf {
    let t1 = format!("{id}_T1_ax.nii.gz");
    let t2 = format!("{id}_T2_ax.nii.gz");
    let flair = format!("{id}_FLAIR_ax.nii.gz");
    write_subject(input_root, id, &[&t1, &t2, &flair])
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// What the fake container does for one (image, subject).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Copy every input NIfTI name to the output; the segmentation image
    /// writes a `_seg` file plus a volume table instead.
    WriteOutputs,
    /// Exit zero without writing anything.
    NoOutput,
    Exit(i32),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub image: String,
    pub subject: String,
    pub command: ContainerCommand,
}

/// Recording in-memory runtime. Clones share their call log.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    calls: Rc<RefCell<Vec<Invocation>>>,
    scripted: Rc<RefCell<Vec<(String, String, Behavior)>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, image: &str, subject: &str, behavior: Behavior) {
        self.scripted
            .borrow_mut()
            .push((image.to_string(), subject.to_string(), behavior));
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    pub fn subjects_for(&self, image: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.image == image)
            .map(|c| c.subject.clone())
            .collect()
    }

    fn behavior(&self, image: &str, subject: &str) -> Behavior {
        self.scripted
            .borrow()
            .iter()
            .rev()
            .find(|(i, s, _)| i == image && s == subject)
            .map(|(_, _, b)| *b)
            .unwrap_or(Behavior::WriteOutputs)
    }
}

fn mount_host<'a>(command: &'a ContainerCommand, target: &str) -> Option<&'a Path> {
    command
        .mounts
        .iter()
        .find(|m| m.target == target)
        .map(|m| m.host.as_path())
}

impl ContainerRuntime for FakeRuntime {
    fn engine(&self) -> Engine {
        Engine::Docker
    }

    fn prepare_image(&self, _image: &str, _log: &StepLog) -> Result<(), ContainerError> {
        Ok(())
    }

    fn invoke(
        &self,
        command: &ContainerCommand,
        log: &StepLog,
    ) -> Result<Option<i32>, ContainerError> {
        let input = mount_host(command, INPUT_MOUNT).unwrap().to_path_buf();
        let output = mount_host(command, OUTPUT_MOUNT).unwrap().to_path_buf();
        let subject = output.file_name().unwrap().to_string_lossy().to_string();

        self.calls.borrow_mut().push(Invocation {
            image: command.image.clone(),
            subject: subject.clone(),
            command: command.clone(),
        });
        log.append(format!("fake {} for {subject}\n", command.image).as_bytes())
            .unwrap();

        match self.behavior(&command.image, &subject) {
            Behavior::Exit(code) => Ok(Some(code)),
            Behavior::NoOutput => Ok(Some(0)),
            Behavior::WriteOutputs => {
                if command.image == SEGMENT_TUBERS_IMAGE {
                    fs::write(output.join(format!("{subject}_seg.nii.gz")), b"seg").unwrap();
                    fs::write(
                        output.join(VOLUME_FILE_NAME),
                        format!("{VOLUME_HEADER}\n{subject}\t1.0\t2.0\t3.0\t6.0\tnow\n"),
                    )
                    .unwrap();
                } else {
                    // Content grows with every call so a forced rewrite is
                    // visible even within one mtime tick.
                    let body = "x".repeat(self.calls.borrow().len());
                    for entry in fs::read_dir(&input).unwrap() {
                        let path = entry.unwrap().path();
                        let name = path.file_name().unwrap().to_string_lossy().to_string();
                        if is_nifti(&name) {
                            fs::write(output.join(&name), &body).unwrap();
                        }
                    }
                }
                if let Some(masks) = mount_host(command, MASKS_MOUNT) {
                    let writable = command
                        .mounts
                        .iter()
                        .any(|m| m.target == MASKS_MOUNT && !m.read_only);
                    if writable {
                        fs::write(masks.join(format!("{subject}_mask.nii.gz")), b"mask").unwrap();
                    }
                }
                Ok(Some(0))
            }
        }
    }
}
