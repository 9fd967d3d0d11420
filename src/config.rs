/// Training run configuration.
///
/// Loaded from a TOML file (default `./stressnet.toml`, override with
/// `STRESSNET_CONFIG`). Input and output directories may also be supplied
/// through the environment or a `.env` file, which take precedence over
/// the file so a shared config can be pointed at local data.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::join::DataSources;
use crate::logging::LogLevel;
use crate::model::{FEATURE_COUNT, FeatureVariable};
use crate::network::{OptimizerAlgorithm, OptimizerConfig};
use crate::partition::PartitionConfig;

pub const DEFAULT_CONFIG_PATH: &str = "./stressnet.toml";

pub const ENV_CONFIG_PATH: &str = "STRESSNET_CONFIG";
pub const ENV_INPUT_DIR: &str = "STRESSNET_INPUT_DIR";
pub const ENV_OUTPUT_DIR: &str = "STRESSNET_OUTPUT_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("could not parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Config structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
            timestamps: true,
        }
    }
}

/// Every recognized option. Defaults are the short-vegetation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Vegetation class suffix in file names, e.g. `short_vegetation`.
    pub vegetation: String,
    pub shuffle: bool,
    pub batch_size: usize,
    pub train_percent: f64,
    pub input_features: usize,
    pub output_width: usize,
    /// Divides every hidden-layer width. 1 trains the full network;
    /// larger values give quick smoke runs.
    pub width_divisor: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerAlgorithm,
    pub epochs: usize,
    /// Fixes both shuffle passes, dropout masks and weight init.
    pub seed: Option<u64>,
    pub verify_sources: bool,
    /// Generate synthetic inputs under `input_dir` before running.
    pub dev_mode: bool,
    pub logging: LoggingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./data"),
            output_dir: PathBuf::from("./models"),
            vegetation: "short_vegetation".to_string(),
            shuffle: true,
            batch_size: 100,
            train_percent: 85.0,
            input_features: FEATURE_COUNT,
            output_width: 1,
            width_divisor: 1,
            learning_rate: 0.000142,
            optimizer: OptimizerAlgorithm::Adam,
            epochs: 900,
            seed: None,
            verify_sources: false,
            dev_mode: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: TrainingConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. A missing file is an error; use
    /// [`TrainingConfig::load`] for the default-path lookup.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Resolve the config the way the binary does: `.env`, then the file at
    /// `STRESSNET_CONFIG` (or the default path, if it exists), then
    /// directory overrides from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() || std::env::var(ENV_CONFIG_PATH).is_ok() {
            Self::from_file(&path)?
        } else {
            TrainingConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply directory overrides. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_INPUT_DIR) {
            self.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_features != FEATURE_COUNT {
            return Err(ConfigError::Invalid {
                key: "input_features",
                reason: format!(
                    "feature schema has {} columns, got {}",
                    FEATURE_COUNT, self.input_features
                ),
            });
        }
        if !(0.0..=100.0).contains(&self.train_percent) {
            return Err(ConfigError::Invalid {
                key: "train_percent",
                reason: format!("{} outside [0, 100]", self.train_percent),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.output_width == 0 {
            return Err(ConfigError::Invalid {
                key: "output_width",
                reason: "must be positive".to_string(),
            });
        }
        if self.width_divisor == 0 {
            return Err(ConfigError::Invalid {
                key: "width_divisor",
                reason: "must be positive".to_string(),
            });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::Invalid {
                key: "learning_rate",
                reason: format!("{} is not a positive number", self.learning_rate),
            });
        }
        if self.vegetation.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "vegetation",
                reason: "must name a vegetation class".to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived paths and sub-configs
    // -----------------------------------------------------------------------

    pub fn site_catalog_path(&self) -> PathBuf {
        self.input_dir.join(format!("sites_{}.csv", self.vegetation))
    }

    /// Source paths for every feature table and the target table.
    pub fn data_sources(&self) -> DataSources {
        let mut sources = DataSources::new(
            self.input_dir.join(format!("str_{}.csv", self.vegetation)),
        );
        for variable in FeatureVariable::ALL {
            sources.insert(
                variable,
                self.input_dir
                    .join(format!("{}_{}.csv", variable.code(), self.vegetation)),
                self.input_dir
                    .join(format!("{}_{}_anomaly.csv", variable.code(), self.vegetation)),
            );
        }
        sources
    }

    /// Directory the trained bundle is written to.
    pub fn bundle_dir(&self) -> PathBuf {
        self.output_dir.join(format!("stressnet_{}", self.vegetation))
    }

    pub fn partition_config(&self) -> PartitionConfig {
        PartitionConfig {
            shuffle: self.shuffle,
            batch_size: self.batch_size,
            train_percent: self.train_percent,
            seed: self.seed,
        }
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            algorithm: self.optimizer,
            learning_rate: self.learning_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
