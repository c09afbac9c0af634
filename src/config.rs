use std::{
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::model::{InputSpec, LanguageField};

#[derive(Debug)]
pub enum ConfigError {
    /// The configuration is well formed but unusable.
    Invalid(String),
    Parse(serde_json::Error),
    Io(io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
            Self::Parse(e) => write!(f, "malformed config: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Everything a run is configured with. Missing JSON fields take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub lr: f64,
    pub lr_backbone: f64,
    pub batch_size: usize,
    pub weight_decay: f64,
    pub epochs: usize,
    /// Epochs between learning rate decays, also forces an epoch snapshot.
    pub lr_drop: usize,
    /// Gradient clipping threshold, disabled when not positive.
    pub clip_max_norm: f64,
    /// Root of the run outputs, nothing is written when unset.
    pub output_dir: Option<PathBuf>,
    pub ds_name: String,
    pub lab_name: String,
    pub seed: u64,
    /// Checkpoint to start from.
    pub resume: Option<PathBuf>,
    pub start_epoch: usize,
    /// Only evaluate the (resumed) model.
    pub eval: bool,
    /// Where evaluation renders go, relative to the output directory.
    pub visualize_dir: Option<PathBuf>,
    pub language: LanguageField,
    pub use_image: bool,
    /// Epochs between numbered snapshots.
    pub snapshot_every: usize,
    pub print_freq: usize,
    pub window_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            lr_backbone: 1e-5,
            batch_size: 18,
            weight_decay: 1e-4,
            epochs: 40,
            lr_drop: 30,
            clip_max_norm: 0.1,
            output_dir: Some(PathBuf::from("results")),
            ds_name: "vg".into(),
            lab_name: "demo".into(),
            seed: 42,
            resume: None,
            start_epoch: 0,
            eval: false,
            visualize_dir: None,
            language: LanguageField::default(),
            use_image: true,
            snapshot_every: 1,
            print_freq: 10,
            window_size: 20,
        }
    }
}

impl RunConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    /// Returns a `ConfigError` if the file can't be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(&fs::read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigError::Invalid` describing the first unusable setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));

        if self.epochs == 0 {
            return invalid("epochs must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.lr_drop == 0 {
            return invalid("lr_drop must be positive");
        }
        if self.snapshot_every == 0 {
            return invalid("snapshot_every must be positive");
        }
        if self.start_epoch > self.epochs {
            return Err(ConfigError::Invalid(format!(
                "start_epoch ({}) is past epochs ({})",
                self.start_epoch, self.epochs
            )));
        }
        if !(self.lr.is_finite() && self.lr_backbone.is_finite() && self.weight_decay.is_finite()) {
            return invalid("learning rates and weight decay must be finite");
        }

        Ok(())
    }

    /// `output_dir/ds_name/lab_name`, if an output directory is configured.
    pub fn run_dir(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(&self.ds_name).join(&self.lab_name))
    }

    /// The visualization directory, only when both it and an output directory
    /// are configured.
    pub fn visualize_path(&self) -> Option<PathBuf> {
        Some(self.run_dir()?.join(self.visualize_dir.as_ref()?))
    }

    /// The configuration as stored in checkpoints.
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` if a path isn't valid UTF-8.
    pub fn to_json(&self) -> Result<serde_json::Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn input_spec(&self) -> InputSpec {
        InputSpec {
            language: self.language,
            use_image: self.use_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: RunConfig =
            serde_json::from_str(r#"{"epochs": 3, "language": "sents"}"#).unwrap();

        assert_eq!(config.epochs, 3);
        assert_eq!(config.language, LanguageField::Sentences);
        assert_eq!(config.lr_drop, 30);
        assert_eq!(config.run_dir(), Some(PathBuf::from("results/vg/demo")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let bad = [
            RunConfig { epochs: 0, ..Default::default() },
            RunConfig { lr_drop: 0, ..Default::default() },
            RunConfig { start_epoch: 41, ..Default::default() },
            RunConfig { lr: f64::NAN, ..Default::default() },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn visualization_needs_an_output_dir() {
        let mut config = RunConfig {
            visualize_dir: Some("vis".into()),
            ..Default::default()
        };
        assert_eq!(config.visualize_path(), Some(PathBuf::from("results/vg/demo/vis")));

        config.output_dir = None;
        assert_eq!(config.visualize_path(), None);
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(RunConfig::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_fail_to_serialize() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let config = RunConfig {
            resume: Some(PathBuf::from(OsStr::from_bytes(b"run\xff.safetensors"))),
            ..Default::default()
        };

        assert!(matches!(config.to_json(), Err(ConfigError::Parse(_))));
        assert_eq!(RunConfig::default().to_json().unwrap()["epochs"], 40);
    }
}
