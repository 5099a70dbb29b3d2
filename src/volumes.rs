//! Aggregate tuber-burden table.
//!
//! The segmentation image writes `results/<subject>/volume_results.txt`. Once
//! the final step has finished for every subject these are concatenated, in
//! subject order, into `results/volume_results.txt` under a single header.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const VOLUME_FILE_NAME: &str = "volume_results.txt";

pub const VOLUME_HEADER: &str =
    "Subject_ID\tT1_Volume_mm3\tT2_Volume_mm3\tFLAIR_Volume_mm3\tTotal_Volume_mm3\tGenerated_Timestamp";

/// Write the aggregate table. Returns its path, or `None` when no subject
/// produced a volume file.
pub fn aggregate_volume_results<S: AsRef<str>>(
    results_dir: &Path,
    subjects: &[S],
) -> io::Result<Option<PathBuf>> {
    let mut body = String::new();
    body.push_str(VOLUME_HEADER);
    body.push('\n');

    let mut found = 0usize;
    for subject in subjects {
        let path = results_dir.join(subject.as_ref()).join(VOLUME_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        found += 1;
        for line in raw.lines() {
            if line.trim().is_empty() || line.starts_with("Subject_ID") {
                continue;
            }
            body.push_str(line);
            body.push('\n');
        }
    }

    if found == 0 {
        warn!("no per-subject volume results found under '{}'", results_dir.display());
        return Ok(None);
    }

    let out = results_dir.join(VOLUME_FILE_NAME);
    fs::write(&out, body)?;
    info!("aggregated volume results for {found} subject(s): '{}'", out.display());
    Ok(Some(out))
}
