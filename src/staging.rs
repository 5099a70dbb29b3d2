//! In-process file staging for the steps that do not always need a container.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::discovery::Modality;
use crate::step::is_nifti;

/// Copy `files` into `dest`, keeping their names. Returns how many were copied.
pub fn stage_files<'a, I>(files: I, dest: &Path) -> io::Result<usize>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for src in files {
        let Some(name) = src.file_name() else {
            continue;
        };
        fs::copy(src, dest.join(name))?;
        copied += 1;
    }
    Ok(copied)
}

/// Regular NIfTI files directly inside `dir`, sorted by path.
/// A missing directory yields an empty list.
pub fn nifti_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && file_name(&path).is_some_and(is_nifti) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

pub fn is_t2(path: &Path) -> bool {
    file_name(path).and_then(Modality::detect) == Some(Modality::T2)
}

/// Number of T2 NIfTI files in `dir`.
pub fn count_t2(dir: &Path) -> io::Result<usize> {
    Ok(nifti_files(dir)?.iter().filter(|p| is_t2(p)).count())
}

/// Copy every NIfTI file from `input` to `output` unchanged.
pub fn copy_nifti(input: &Path, output: &Path) -> io::Result<usize> {
    stage_files(&nifti_files(input)?, output)
}

/// Stand-in for a failed T2 combination: the first T2 file by name plus all
/// non-T2 files. Returns the T2 file that was kept, `None` if there was none.
pub fn single_t2_substitution(input: &Path, output: &Path) -> io::Result<Option<PathBuf>> {
    let files = nifti_files(input)?;
    let chosen = files.iter().find(|p| is_t2(p)).cloned();
    let keep: Vec<PathBuf> = files
        .into_iter()
        .filter(|p| !is_t2(p) || Some(p) == chosen.as_ref())
        .collect();
    stage_files(&keep, output)?;
    Ok(chosen)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}
