//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[validate]
    pub aggregation: AggregationSettings,
    pub storage: StorageSettings,
    #[validate]
    pub procedures: ProcedureSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("chithram")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8080"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_API__BIND_ADDRESS=127.0.0.1:8080
    /// ```
    pub bind_address: SocketAddr,

    /// The maximal size of an uploaded model update, in bytes.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// max_upload_size = 536870912
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_API__MAX_UPLOAD_SIZE=536870912
    /// ```
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
}

fn default_max_upload_size() -> u64 {
    512 * 1024 * 1024
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_aggregation"))]
/// Aggregation pass settings.
pub struct AggregationSettings {
    /// The time between two scheduled aggregation passes, in seconds.
    ///
    /// A pass that takes longer than the interval delays the next one; passes never overlap.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// interval = 60
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_AGGREGATION__INTERVAL=60
    /// ```
    #[serde(default = "default_interval")]
    #[validate(range(min = 1))]
    pub interval: u64,

    /// The minimal number of staged updates required to run a merge.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// min_updates = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_AGGREGATION__MIN_UPDATES=2
    /// ```
    #[serde(default = "default_min_updates")]
    #[validate(range(min = 1))]
    pub min_updates: usize,

    /// The name under which the served model is registered in the version registry and the
    /// metric ledger.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// model_name = "face-detection"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_AGGREGATION__MODEL_NAME=face-detection
    /// ```
    #[serde(default = "default_model_name")]
    #[validate(length(min = 1))]
    pub model_name: String,

    /// The file extension (without the leading dot) of artifacts taken into account for
    /// aggregation and recovery. Staged files with any other extension are left alone.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// extension = "onnx"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_AGGREGATION__EXTENSION=onnx
    /// ```
    #[serde(default = "default_extension")]
    #[validate(length(min = 1))]
    pub extension: String,
}

fn default_interval() -> u64 {
    60
}

fn default_min_updates() -> usize {
    2
}

fn default_model_name() -> String {
    "face-detection".to_string()
}

fn default_extension() -> String {
    "onnx".to_string()
}

#[derive(Debug, Deserialize, Clone)]
/// Artifact and metadata locations.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [storage]
/// staging_dir = "./fl_updates/pending"
/// archive_dir = "./fl_models"
/// live_path = "./models/face-detection.onnx"
/// default_model = "./models/face-detection.onnx"
/// metadata_path = "./fl_metadata.json"
/// ```
///
/// **Environment variable**
/// ```text
/// CHITHRAM_STORAGE__STAGING_DIR=/var/lib/chithram/pending
/// ```
pub struct StorageSettings {
    /// The directory holding uploaded updates awaiting aggregation.
    pub staging_dir: PathBuf,
    /// The directory holding merged and superseded artifacts.
    pub archive_dir: PathBuf,
    /// The location of the artifact served to clients.
    pub live_path: PathBuf,
    /// The artifact served when no aggregated artifact has been archived yet.
    pub default_model: PathBuf,
    /// The JSON document backing the version registry and the metric ledger.
    pub metadata_path: PathBuf,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// Settings of the external procedures.
pub struct ProcedureSettings {
    #[validate]
    pub merge: CommandSettings,
    #[validate]
    pub evaluate: CommandSettings,
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// An external command.
///
/// The command is invoked as `program args...` followed by the arguments of the procedure.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [procedures.merge]
/// program = "python"
/// args = ["./scripts/aggregate_models.py"]
/// ```
///
/// **Environment variable**
/// ```text
/// CHITHRAM_PROCEDURES__MERGE__PROGRAM=/opt/venv/bin/python
/// ```
pub struct CommandSettings {
    #[validate(length(min = 1))]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
/// Startup recovery settings.
pub struct RecoverySettings {
    /// The pristine baseline artifact evaluated at startup, if any.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [recovery]
    /// baseline = "./models/yolov8n.onnx"
    /// ```
    #[serde(default)]
    pub baseline: Option<PathBuf>,

    /// The metric ledger is backfilled from the archive when it holds no more than this many
    /// rows after the reference artifacts have been evaluated.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [recovery]
    /// backfill_threshold = 2
    /// ```
    #[serde(default = "default_backfill_threshold")]
    pub backfill_threshold: u64,
}

fn default_backfill_threshold() -> u64 {
    2
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            baseline: None,
            backfill_threshold: default_backfill_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// CHITHRAM_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

impl AggregationSettings {
    /// Checks that the extension is given without a leading dot.
    fn validate_extension(&self) -> Result<(), ValidationError> {
        if self.extension.starts_with('.') {
            Err(ValidationError::new("extension must not start with a dot"))
        } else {
            Ok(())
        }
    }
}

/// A wrapper for validate derive.
fn validate_aggregation(s: &AggregationSettings) -> Result<(), ValidationError> {
    s.validate_extension()
}
