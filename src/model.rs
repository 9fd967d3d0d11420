/// Core data types for the StressNet training pipeline.
///
/// This module defines the shared domain model imported by all other
/// modules: the fixed feature schema, joined corpus rows, batches, and the
/// error taxonomy. It contains no I/O.

use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Sentinels and limits
// ---------------------------------------------------------------------------

/// Placeholder values used by the source tables to mean "no observation".
pub const SENTINEL_VALUES: [f64; 2] = [-9999.0, -999.0];

/// Transpiration stress is bounded above; larger source values are clamped.
pub const STRESS_UPPER_BOUND: f64 = 1.0;

/// Number of feature columns in the corpus (6 variables x 2 forms).
pub const FEATURE_COUNT: usize = 12;

/// Column name of the target series.
pub const TARGET_COLUMN: &str = "str";

/// Returns `true` if `value` is one of the known sentinel placeholders.
pub fn is_sentinel(value: f64) -> bool {
    SENTINEL_VALUES.contains(&value)
}

// ---------------------------------------------------------------------------
// Feature schema
// ---------------------------------------------------------------------------

/// Physical covariates fed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureVariable {
    /// Air temperature.
    Ate,
    /// Atmospheric carbon dioxide.
    Co2,
    /// Plant available water.
    Ssh,
    /// Incoming shortwave radiation.
    Swi,
    /// Vegetation optical depth.
    Vod,
    /// Vapour pressure deficit.
    Vpd,
}

impl FeatureVariable {
    pub const ALL: [FeatureVariable; 6] = [
        FeatureVariable::Ate,
        FeatureVariable::Co2,
        FeatureVariable::Ssh,
        FeatureVariable::Swi,
        FeatureVariable::Vod,
        FeatureVariable::Vpd,
    ];

    /// Short code used in file and column names.
    pub fn code(self) -> &'static str {
        match self {
            FeatureVariable::Ate => "ate",
            FeatureVariable::Co2 => "co2",
            FeatureVariable::Ssh => "ssh",
            FeatureVariable::Swi => "swi",
            FeatureVariable::Vod => "vod",
            FeatureVariable::Vpd => "vpd",
        }
    }
}

impl fmt::Display for FeatureVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Whether a series holds raw values or deviations from climatology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesForm {
    Absolute,
    Anomaly,
}

/// One column slot of the feature matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureSlot {
    pub variable: FeatureVariable,
    pub form: SeriesForm,
}

impl FeatureSlot {
    /// Column name, e.g. `vpd` or `vpdanm`.
    pub fn column_name(&self) -> String {
        match self.form {
            SeriesForm::Absolute => self.variable.code().to_string(),
            SeriesForm::Anomaly => format!("{}anm", self.variable.code()),
        }
    }
}

const fn slot(variable: FeatureVariable, form: SeriesForm) -> FeatureSlot {
    FeatureSlot { variable, form }
}

/// Ordered feature columns. Column `i` of every feature matrix holds
/// `FEATURE_SCHEMA[i]`; the absolute form of a variable always precedes
/// its anomaly.
pub static FEATURE_SCHEMA: [FeatureSlot; FEATURE_COUNT] = [
    slot(FeatureVariable::Ate, SeriesForm::Absolute),
    slot(FeatureVariable::Ate, SeriesForm::Anomaly),
    slot(FeatureVariable::Co2, SeriesForm::Absolute),
    slot(FeatureVariable::Co2, SeriesForm::Anomaly),
    slot(FeatureVariable::Ssh, SeriesForm::Absolute),
    slot(FeatureVariable::Ssh, SeriesForm::Anomaly),
    slot(FeatureVariable::Swi, SeriesForm::Absolute),
    slot(FeatureVariable::Swi, SeriesForm::Anomaly),
    slot(FeatureVariable::Vod, SeriesForm::Absolute),
    slot(FeatureVariable::Vod, SeriesForm::Anomaly),
    slot(FeatureVariable::Vpd, SeriesForm::Absolute),
    slot(FeatureVariable::Vpd, SeriesForm::Anomaly),
];

/// Feature column names in schema order.
pub fn feature_columns() -> Vec<String> {
    FEATURE_SCHEMA.iter().map(FeatureSlot::column_name).collect()
}

// ---------------------------------------------------------------------------
// Corpus types
// ---------------------------------------------------------------------------

/// One complete time step for one site.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub site_id: String,
    pub time: NaiveDateTime,
    pub features: [f64; FEATURE_COUNT],
    pub target: f64,
}

/// All joined rows across sites, in site order then time order.
///
/// Every row is complete: no missing value and no sentinel in any of the
/// 13 columns. The row index is simply the position in `rows`.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub rows: Vec<JoinedRow>,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Robust scale statistics over the full pre-split corpus.
///
/// `max` (95th percentile) is the divisor applied to features. `min`
/// (5th percentile) is recorded and persisted with the
/// model but never applied to the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleVectors {
    pub columns: Vec<String>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

/// A fixed-size group of normalized rows.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Normalized features, one row per sample.
    pub features: Array2<f64>,
    pub targets: Array1<f64>,
    /// Corpus row index of each sample.
    pub rows: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Train or validation subset, already batched.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub batches: Vec<Batch>,
}

impl Partition {
    /// Total number of samples across all batches.
    pub fn len(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Corpus row ids of every sample, in batch order.
    pub fn row_ids(&self) -> Vec<usize> {
        self.batches.iter().flat_map(|b| b.rows.iter().copied()).collect()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures while resolving the site catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("site catalog {path} unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("site catalog {path} has no complete site entries ({dropped} dropped)")]
    Empty { path: PathBuf, dropped: usize },
}

/// Failures while loading and joining the variable tables.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("source for {variable} unreadable ({path}): {reason}")]
    SourceUnreadable {
        variable: String,
        path: PathBuf,
        reason: String,
    },
    #[error("site {site} not present in {variable} table")]
    SiteMissing { site: String, variable: String },
    #[error("invalid feature schema: {0}")]
    InvalidSchema(String),
    #[error("joined corpus is empty after completeness filtering ({sites} sites)")]
    EmptyCorpus { sites: usize },
}

/// Failures while shuffling, normalizing and splitting the corpus.
#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("train percentage {0} outside [0, 100]")]
    InvalidPercentage(f64),
    #[error("batch size must be positive")]
    InvalidBatchSize,
    #[error("{which} partition is empty ({total} corpus rows, {percent}% train)")]
    EmptyPartition {
        which: &'static str,
        total: usize,
        percent: f64,
    },
    #[error("feature column {column} has degenerate 95th percentile {value}")]
    DegenerateScale { column: String, value: f64 },
}

/// Degenerate skill-score computations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NumericError {
    #[error("actual and predicted lengths differ ({actual} vs {predicted})")]
    LengthMismatch { actual: usize, predicted: usize },
    #[error("skill score needs at least one sample")]
    EmptyInput,
    #[error("zero variance in {0} values")]
    ZeroVariance(&'static str),
    #[error("mean of actual values is zero; bias ratio undefined")]
    ZeroMean,
    #[error("non-finite {0}")]
    NonFinite(&'static str),
}

impl NumericError {
    /// Degenerate batches (constant target or prediction) can be skipped;
    /// other numeric errors indicate a broken run.
    pub fn is_degenerate_batch(&self) -> bool {
        matches!(self, NumericError::ZeroVariance(_) | NumericError::ZeroMean)
    }
}

/// Top-level error for a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Numeric(#[from] NumericError),
    #[error(transparent)]
    Model(#[from] crate::network::ModelError),
    #[error(transparent)]
    Train(#[from] crate::train::TrainError),
    #[error(transparent)]
    Artifact(#[from] crate::artifact::ArtifactError),
    #[error(transparent)]
    Verify(#[from] crate::verify::VerifyError),
    #[error("dev mode data generation failed: {0}")]
    DevMode(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
