//! Subject discovery.
//!
//! Every immediate, non-hidden subdirectory of the input root is a candidate
//! subject. Candidates come back sorted by name so logs from repeated runs
//! diff cleanly. Only NIfTI files inside a subject directory are looked at;
//! sidecars such as `.json` headers are ignored outright.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ConfigError, ValidationError};
use crate::step::is_nifti;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Modality {
    T1,
    T2,
    #[serde(rename = "FLAIR")]
    Flair,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::T1, Modality::T2, Modality::Flair];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::T1 => "T1",
            Modality::T2 => "T2",
            Modality::Flair => "FLAIR",
        }
    }

    /// Token that must appear in a file name for it to carry this modality.
    pub fn token(self) -> &'static str {
        match self {
            Modality::T1 => "_T1_",
            Modality::T2 => "_T2_",
            Modality::Flair => "_FLAIR_",
        }
    }

    /// First modality (in T1, T2, FLAIR order) whose token occurs in `file_name`.
    pub fn detect(file_name: &str) -> Option<Modality> {
        Self::ALL.into_iter().find(|m| file_name.contains(m.token()))
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectStatus {
    Valid,
    Invalid(ValidationError),
}

/// One patient case. Immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub dir: PathBuf,
    pub files: BTreeMap<Modality, Vec<PathBuf>>,
    pub naming_violations: Vec<PathBuf>,
    pub status: SubjectStatus,
}

impl Subject {
    /// Classify the files of one subject directory.
    pub fn inspect(id: &str, dir: &Path) -> Result<Self, ConfigError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || is_hidden(&path) || !has_nifti_name(&path) {
                continue;
            }
            names.push(path);
        }
        names.sort();
        Ok(Self::classify(id, dir, names))
    }

    /// Pure classification over an already-listed set of files.
    pub fn classify(id: &str, dir: &Path, paths: Vec<PathBuf>) -> Self {
        let prefix = format!("{id}_");
        let mut files: BTreeMap<Modality, Vec<PathBuf>> = BTreeMap::new();
        let mut naming_violations = Vec::new();

        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            match Modality::detect(name) {
                Some(m) if name.starts_with(&prefix) => files.entry(m).or_default().push(path),
                _ => naming_violations.push(path),
            }
        }

        let missing: Vec<Modality> = Modality::ALL
            .into_iter()
            .filter(|m| files.get(m).map_or(true, |v| v.is_empty()))
            .collect();
        let status = if missing.is_empty() {
            SubjectStatus::Valid
        } else {
            SubjectStatus::Invalid(ValidationError::MissingModalities(missing))
        };

        Self {
            id: id.to_string(),
            dir: dir.to_path_buf(),
            files,
            naming_violations,
            status,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.status, SubjectStatus::Valid)
    }

    pub fn validation_error(&self) -> Option<&ValidationError> {
        match &self.status {
            SubjectStatus::Valid => None,
            SubjectStatus::Invalid(err) => Some(err),
        }
    }

    pub fn count(&self, modality: Modality) -> usize {
        self.files.get(&modality).map_or(0, Vec::len)
    }

    /// Correctly named files, in modality then name order.
    pub fn accepted_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.values().flatten()
    }
}

/// Scan `input_root` and classify every candidate subject.
pub fn discover_subjects(input_root: &Path) -> Result<Vec<Subject>, ConfigError> {
    if !input_root.is_dir() {
        return Err(ConfigError::InputRootMissing(input_root.to_path_buf()));
    }

    let entries = fs::read_dir(input_root).map_err(|source| ConfigError::Directory {
        path: input_root.to_path_buf(),
        source,
    })?;

    let mut candidates: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Directory {
            path: input_root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() || is_hidden(&path) {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(id) => candidates.push((id, path)),
            Err(raw) => warn!("skipping subject directory with non UTF-8 name: {raw:?}"),
        }
    }

    if candidates.is_empty() {
        return Err(ConfigError::NoSubjects(input_root.to_path_buf()));
    }
    candidates.sort();

    let mut subjects = Vec::with_capacity(candidates.len());
    for (id, dir) in candidates {
        let subject = Subject::inspect(&id, &dir)?;
        for bad in &subject.naming_violations {
            warn!(subject = %id, file = %bad.display(), "invalid naming convention, file excluded");
        }
        match &subject.status {
            SubjectStatus::Valid => info!(
                subject = %id,
                t1 = subject.count(Modality::T1),
                t2 = subject.count(Modality::T2),
                flair = subject.count(Modality::Flair),
                "found subject"
            ),
            SubjectStatus::Invalid(err) => warn!(subject = %id, "invalid subject: {err}"),
        }
        subjects.push(subject);
    }

    info!("total subjects found: {}", subjects.len());
    Ok(subjects)
}

fn has_nifti_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_nifti)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}
