//! Run configuration.
//!
//! Everything the pipeline needs from the environment is read exactly once,
//! here, into an immutable [`PipelineConfig`]. Components receive the config
//! by reference and never consult `std::env` themselves.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::runtime::Engine;

pub const PROJECT_ROOT_ENV: &str = "TUBER_PROJECT_ROOT";
pub const USE_GPU_ENV: &str = "USE_GPU";
pub const CONTAINER_ENGINE_ENV: &str = "TUBER_CONTAINER_ENGINE";
pub const CONTAINER_ARGS_ENV: &str = "TUBER_CONTAINER_ARGS";

/// Raw input root, relative to the project root.
pub const INPUT_DIR_NAME: &str = "TSC_MRI_SUB";

/// `USE_GPU` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuMode {
    #[default]
    Auto,
    On,
    Off,
}

impl FromStr for GpuMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(GpuMode::Auto),
            "true" => Ok(GpuMode::On),
            "false" => Ok(GpuMode::Off),
            _ => Err(ConfigError::InvalidEnv {
                var: USE_GPU_ENV,
                value: raw.to_string(),
                expected: "auto, true or false",
            }),
        }
    }
}

/// Image references that may replace the built-in ones (e.g. pinned digests
/// or a registry mirror).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageOverrides {
    #[serde(default)]
    pub skull_strip: Option<String>,
    #[serde(default)]
    pub combine_t2: Option<String>,
    #[serde(default)]
    pub register_to_mni: Option<String>,
    #[serde(default)]
    pub segment_tubers: Option<String>,
}

/// Optional YAML settings file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub images: ImageOverrides,

    /// Extra flags appended to every container run (before the image).
    #[serde(default)]
    pub container_args: Vec<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| ConfigError::SettingsParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Values supplied on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub project_root: Option<PathBuf>,
    pub settings_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub project_root: PathBuf,
    pub input_dir: PathBuf,
    pub preprocessing_dir: PathBuf,
    pub masks_dir: PathBuf,
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub gpu_mode: GpuMode,
    /// Forced engine; `None` means probe docker, apptainer, singularity in order.
    pub engine: Option<Engine>,
    pub container_args: Vec<String>,
    pub images: ImageOverrides,
}

impl PipelineConfig {
    /// Layout and defaults for a project root, without consulting the environment.
    pub fn from_project_root(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let preprocessing_dir = project_root.join("preprocessing");
        Self {
            input_dir: project_root.join(INPUT_DIR_NAME),
            masks_dir: preprocessing_dir.join("masks"),
            results_dir: project_root.join("results"),
            logs_dir: project_root.join("logs"),
            preprocessing_dir,
            project_root,
            gpu_mode: GpuMode::Auto,
            engine: None,
            container_args: Vec::new(),
            images: ImageOverrides::default(),
        }
    }

    /// Build the run configuration from CLI overrides and the process environment.
    pub fn from_env(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::from_lookup(overrides, |key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an injectable variable lookup.
    pub fn from_lookup<F>(overrides: &ConfigOverrides, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_root = match (&overrides.project_root, lookup(PROJECT_ROOT_ENV)) {
            (Some(p), _) => p.clone(),
            (None, Some(v)) if !v.trim().is_empty() => PathBuf::from(v.trim()),
            _ => std::env::current_dir().map_err(|source| ConfigError::Directory {
                path: PathBuf::from("."),
                source,
            })?,
        };

        // Mount sources must be absolute, so resolve the root up front.
        if !raw_root.is_dir() {
            return Err(ConfigError::ProjectRootMissing(raw_root));
        }
        let project_root = raw_root
            .canonicalize()
            .map_err(|_| ConfigError::ProjectRootMissing(raw_root.clone()))?;

        let settings = match &overrides.settings_file {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        let mut config = Self::from_project_root(project_root);
        config.images = settings.images;
        config.container_args = settings.container_args;

        if let Some(raw) = lookup(USE_GPU_ENV) {
            config.gpu_mode = raw.parse()?;
        }

        if let Some(raw) = lookup(CONTAINER_ENGINE_ENV) {
            if !raw.trim().is_empty() {
                config.engine = Some(raw.parse().map_err(|_| ConfigError::InvalidEnv {
                    var: CONTAINER_ENGINE_ENV,
                    value: raw.clone(),
                    expected: "docker, apptainer or singularity",
                })?);
            }
        }

        if let Some(raw) = lookup(CONTAINER_ARGS_ENV) {
            config.container_args = raw.split_whitespace().map(str::to_string).collect();
        }

        Ok(config)
    }

    /// Create every working directory the steps write into.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        let dirs = [
            self.preprocessing_dir.join("MRI_files"),
            self.preprocessing_dir.join("skull_stripped_MRIs"),
            self.masks_dir.clone(),
            self.preprocessing_dir.join("combined_MRIs"),
            self.preprocessing_dir.join("preprocessed_MRIs"),
            self.results_dir.clone(),
            self.logs_dir.clone(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir)
                .map_err(|source| ConfigError::Directory { path: dir, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_root(prefix: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "tuber-config-{prefix}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn gpu_mode_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<GpuMode>().unwrap(), GpuMode::Auto);
        assert_eq!("True".parse::<GpuMode>().unwrap(), GpuMode::On);
        assert_eq!("false".parse::<GpuMode>().unwrap(), GpuMode::Off);
        let err = "maybe".parse::<GpuMode>().unwrap_err();
        assert!(err.to_string().contains("USE_GPU"), "{err}");
    }

    #[test]
    fn project_root_env_is_used_when_no_cli_override() {
        let root = temp_root("env-root");
        let lookup = lookup_from(&[
            (PROJECT_ROOT_ENV, root.to_str().unwrap()),
            (USE_GPU_ENV, "false"),
        ]);
        let cfg = PipelineConfig::from_lookup(&ConfigOverrides::default(), lookup).unwrap();
        assert_eq!(cfg.project_root, root.canonicalize().unwrap());
        assert_eq!(cfg.gpu_mode, GpuMode::Off);
        assert!(cfg.input_dir.ends_with(INPUT_DIR_NAME));
    }

    #[test]
    fn cli_root_wins_over_env_root() {
        let env_root = temp_root("env-loses");
        let cli_root = temp_root("cli-wins");
        let overrides = ConfigOverrides {
            project_root: Some(cli_root.clone()),
            settings_file: None,
        };
        let lookup = lookup_from(&[(PROJECT_ROOT_ENV, env_root.to_str().unwrap())]);
        let cfg = PipelineConfig::from_lookup(&overrides, lookup).unwrap();
        assert_eq!(cfg.project_root, cli_root.canonicalize().unwrap());
    }

    #[test]
    fn missing_project_root_is_a_config_error() {
        let overrides = ConfigOverrides {
            project_root: Some(PathBuf::from("/definitely/not/here/tuber")),
            settings_file: None,
        };
        let err = PipelineConfig::from_lookup(&overrides, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::ProjectRootMissing(_)), "{err}");
    }

    #[test]
    fn settings_file_overrides_images_and_env_overrides_args() {
        let root = temp_root("settings");
        let settings = root.join("pipeline.yaml");
        fs::write(
            &settings,
            "images:\n  segment_tubers: \"registry.local/seg@sha256:abc\"\ncontainer_args: [\"--shm-size\", \"2g\"]\n",
        )
        .unwrap();

        let overrides = ConfigOverrides {
            project_root: Some(root.clone()),
            settings_file: Some(settings),
        };
        let cfg = PipelineConfig::from_lookup(&overrides, |_| None).unwrap();
        assert_eq!(
            cfg.images.segment_tubers.as_deref(),
            Some("registry.local/seg@sha256:abc")
        );
        assert_eq!(cfg.container_args, vec!["--shm-size", "2g"]);

        let lookup = lookup_from(&[(CONTAINER_ARGS_ENV, "--cpus 4")]);
        let cfg = PipelineConfig::from_lookup(&overrides, lookup).unwrap();
        assert_eq!(cfg.container_args, vec!["--cpus", "4"]);
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        let root = temp_root("settings-typo");
        let settings = root.join("pipeline.yaml");
        fs::write(&settings, "imagez: {}\n").unwrap();
        let overrides = ConfigOverrides {
            project_root: Some(root),
            settings_file: Some(settings),
        };
        let err = PipelineConfig::from_lookup(&overrides, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::SettingsParse { .. }), "{err}");
    }

    #[test]
    fn invalid_engine_is_rejected() {
        let root = temp_root("engine");
        let overrides = ConfigOverrides {
            project_root: Some(root),
            settings_file: None,
        };
        let lookup = lookup_from(&[(CONTAINER_ENGINE_ENV, "podman")]);
        let err = PipelineConfig::from_lookup(&overrides, lookup).unwrap_err();
        assert!(err.to_string().contains(CONTAINER_ENGINE_ENV), "{err}");
    }

    #[test]
    fn ensure_directories_creates_stage_dirs() {
        let root = temp_root("ensure");
        let cfg = PipelineConfig::from_project_root(&root);
        cfg.ensure_directories().unwrap();
        assert!(root.join("preprocessing/MRI_files").is_dir());
        assert!(root.join("preprocessing/masks").is_dir());
        assert!(root.join("results").is_dir());
        assert!(root.join("logs").is_dir());
        assert!(!root.join(INPUT_DIR_NAME).exists());
    }
}
