//! The fixed five-step pipeline.
//!
//! Steps are plain data built once from the configuration; nothing mutates
//! them during a run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::PipelineConfig;

pub const SKULL_STRIP_IMAGE: &str =
    "ivansanchezfernandez/skull_strip_and_create_masks_with_synthstrip";
pub const COMBINE_T2_IMAGE: &str = "ivansanchezfernandez/combine_t2_files_with_niftymic";
pub const REGISTER_TO_MNI_IMAGE: &str =
    "ivansanchezfernandez/bias_correct_resample_and_register_to_mni_with_ants";
pub const SEGMENT_TUBERS_IMAGE: &str =
    "ivansanchezfernandez/segment_tubers_and_quantify_tuber_burden_with_tsccnn3d_dropout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    PrepareData,
    SkullStrip,
    CombineT2,
    RegisterToMni,
    SegmentTubers,
}

impl StepId {
    pub const ALL: [StepId; 5] = [
        StepId::PrepareData,
        StepId::SkullStrip,
        StepId::CombineT2,
        StepId::RegisterToMni,
        StepId::SegmentTubers,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n)).copied()
    }

    /// Stable machine name, also used for log artifact file names.
    pub fn name(self) -> &'static str {
        match self {
            StepId::PrepareData => "prepare_data",
            StepId::SkullStrip => "skull_strip",
            StepId::CombineT2 => "combine_t2",
            StepId::RegisterToMni => "register_to_mni",
            StepId::SegmentTubers => "segment_tubers",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            StepId::PrepareData => "Data Preparation",
            StepId::SkullStrip => "Skull Stripping",
            StepId::CombineT2 => "T2 Combination",
            StepId::RegisterToMni => "MNI Registration",
            StepId::SegmentTubers => "Tuber Segmentation",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.ordinal(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskMount {
    pub dir: PathBuf,
    pub access: Access,
}

/// What counts as a produced output file for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPattern {
    Nifti,
    NiftiContaining(&'static str),
}

impl OutputPattern {
    pub fn matches(self, file_name: &str) -> bool {
        match self {
            OutputPattern::Nifti => is_nifti(file_name),
            OutputPattern::NiftiContaining(needle) => {
                is_nifti(file_name) && file_name.to_ascii_lowercase().contains(needle)
            }
        }
    }
}

impl fmt::Display for OutputPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPattern::Nifti => f.write_str("NIfTI file"),
            OutputPattern::NiftiContaining(needle) => write!(f, "NIfTI file containing '{needle}'"),
        }
    }
}

pub fn is_nifti(file_name: &str) -> bool {
    file_name.ends_with(".nii") || file_name.ends_with(".nii.gz")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// `None` for the in-process data preparation step.
    pub image: Option<String>,
    pub workdir: Option<String>,
    pub gpu: bool,
    pub masks: Option<MaskMount>,
    pub writable_tmpfs: bool,
    pub expected_output: OutputPattern,
}

impl Step {
    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn ordinal(&self) -> u8 {
        self.id.ordinal()
    }

    pub fn subject_input(&self, subject: &str) -> PathBuf {
        self.input_dir.join(subject)
    }

    pub fn subject_output(&self, subject: &str) -> PathBuf {
        self.output_dir.join(subject)
    }

    pub fn subject_masks(&self, subject: &str) -> Option<PathBuf> {
        self.masks.as_ref().map(|m| m.dir.join(subject))
    }
}

/// The five steps in execution order.
pub fn catalog(config: &PipelineConfig) -> Vec<Step> {
    let pre = |name: &str| -> PathBuf { config.preprocessing_dir.join(name) };
    let image = |over: &Option<String>, default: &str| -> Option<String> {
        Some(over.clone().unwrap_or_else(|| default.to_string()))
    };
    let images = &config.images;

    vec![
        Step {
            id: StepId::PrepareData,
            input_dir: config.input_dir.clone(),
            output_dir: pre("MRI_files"),
            image: None,
            workdir: None,
            gpu: false,
            masks: None,
            writable_tmpfs: false,
            expected_output: OutputPattern::Nifti,
        },
        Step {
            id: StepId::SkullStrip,
            input_dir: pre("MRI_files"),
            output_dir: pre("skull_stripped_MRIs"),
            image: image(&images.skull_strip, SKULL_STRIP_IMAGE),
            workdir: None,
            gpu: false,
            masks: Some(MaskMount {
                dir: config.masks_dir.clone(),
                access: Access::ReadWrite,
            }),
            writable_tmpfs: false,
            expected_output: OutputPattern::Nifti,
        },
        Step {
            id: StepId::CombineT2,
            input_dir: pre("skull_stripped_MRIs"),
            output_dir: pre("combined_MRIs"),
            image: image(&images.combine_t2, COMBINE_T2_IMAGE),
            // NiftyMIC's entrypoint is a relative script under /app.
            workdir: Some("/app".to_string()),
            gpu: false,
            masks: Some(MaskMount {
                dir: config.masks_dir.clone(),
                access: Access::ReadOnly,
            }),
            writable_tmpfs: true,
            expected_output: OutputPattern::Nifti,
        },
        Step {
            id: StepId::RegisterToMni,
            input_dir: pre("combined_MRIs"),
            output_dir: pre("preprocessed_MRIs"),
            image: image(&images.register_to_mni, REGISTER_TO_MNI_IMAGE),
            // Runs in the image's default working directory.
            workdir: None,
            gpu: false,
            masks: None,
            writable_tmpfs: true,
            expected_output: OutputPattern::Nifti,
        },
        Step {
            id: StepId::SegmentTubers,
            input_dir: pre("preprocessed_MRIs"),
            output_dir: config.results_dir.clone(),
            image: image(&images.segment_tubers, SEGMENT_TUBERS_IMAGE),
            workdir: Some("/app".to_string()),
            gpu: true,
            masks: None,
            writable_tmpfs: false,
            expected_output: OutputPattern::NiftiContaining("seg"),
        },
    ]
}

/// Directory of a step's per-subject input, for display.
pub fn relative_to<'a>(path: &'a Path, root: &Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}
