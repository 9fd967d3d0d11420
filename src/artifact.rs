/// Trained model bundles.
///
/// A bundle directory holds everything needed to reproduce predictions:
/// - `model.json`: spec and weights
/// - `scale.json`: feature column names with both scale vectors
/// - `history.json` / `history.csv`: per-epoch loss and skill curves
///
/// Inference goes through [`InferenceBundle`], which applies the saved
/// max-vector scaling before predicting.

use ndarray::{Array1, Array2, Axis};
use serde::{Serialize, de::DeserializeOwned};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logging::{self, Stage};
use crate::model::ScaleVectors;
use crate::network::{CompiledModel, ModelError, ModelSnapshot, MultiBranchNet};
use crate::train::TrainingHistory;

pub const MODEL_FILE: &str = "model.json";
pub const SCALE_FILE: &str = "scale.json";
pub const HISTORY_JSON_FILE: &str = "history.json";
pub const HISTORY_CSV_FILE: &str = "history.csv";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("bundle is inconsistent: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    // Dropping a BufWriter swallows the final write error
    writer.flush().map_err(io_error(path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let file = File::open(path).map_err(io_error(path))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_history_csv(path: &Path, history: &TrainingHistory) -> Result<(), ArtifactError> {
    let csv_error = |source| ArtifactError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for record in &history.epochs {
        writer.serialize(record).map_err(csv_error)?;
    }
    writer.flush().map_err(io_error(path))
}

// ---------------------------------------------------------------------------
// Saving
// ---------------------------------------------------------------------------

/// Write a bundle into `dir`, creating it if needed. Existing bundle
/// files are overwritten.
pub fn save_bundle(
    dir: &Path,
    model: &CompiledModel,
    scale: &ScaleVectors,
    history: &TrainingHistory,
) -> Result<(), ArtifactError> {
    if scale.max.len() != model.spec().input_width {
        return Err(ArtifactError::Inconsistent(format!(
            "{} scale columns for a model with {} inputs",
            scale.max.len(),
            model.spec().input_width
        )));
    }

    fs::create_dir_all(dir).map_err(io_error(dir))?;

    write_json(&dir.join(MODEL_FILE), &model.snapshot())?;
    write_json(&dir.join(SCALE_FILE), scale)?;
    write_json(&dir.join(HISTORY_JSON_FILE), history)?;
    write_history_csv(&dir.join(HISTORY_CSV_FILE), history)?;

    logging::info(
        Stage::Artifact,
        None,
        &format!(
            "Saved bundle to {} ({} epochs{})",
            dir.display(),
            history.epochs.len(),
            if history.interrupted { ", interrupted" } else { "" }
        ),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Loading and inference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InferenceBundle {
    pub snapshot: ModelSnapshot,
    pub scale: ScaleVectors,
    pub history: TrainingHistory,
}

pub fn load_bundle(dir: &Path) -> Result<InferenceBundle, ArtifactError> {
    let snapshot: ModelSnapshot = read_json(&dir.join(MODEL_FILE))?;
    let scale: ScaleVectors = read_json(&dir.join(SCALE_FILE))?;
    let history: TrainingHistory = read_json(&dir.join(HISTORY_JSON_FILE))?;

    snapshot.validate()?;
    if scale.max.len() != snapshot.network.input_width()
        || scale.min.len() != scale.max.len()
        || scale.columns.len() != scale.max.len()
    {
        return Err(ArtifactError::Inconsistent(format!(
            "scale has {} columns, model expects {}",
            scale.max.len(),
            snapshot.network.input_width()
        )));
    }

    Ok(InferenceBundle {
        snapshot,
        scale,
        history,
    })
}

impl InferenceBundle {
    pub fn network(&self) -> &MultiBranchNet {
        &self.snapshot.network
    }

    /// Divide each raw feature column by its saved 95th percentile.
    pub fn scale_features(&self, raw: &Array2<f64>) -> Result<Array2<f64>, ArtifactError> {
        if raw.ncols() != self.scale.max.len() {
            return Err(ModelError::ShapeMismatch {
                expected: self.scale.max.len(),
                actual: raw.ncols(),
            }
            .into());
        }
        let divisor = Array1::from(self.scale.max.clone());
        Ok(raw / &divisor)
    }

    /// Predicted stress per row of unnormalized features. With several
    /// outputs the row mean is returned.
    pub fn predict(&self, raw: &Array2<f64>) -> Result<Array1<f64>, ArtifactError> {
        let scaled = self.scale_features(raw)?;
        let predictions = self.network().infer(&scaled)?;
        predictions
            .mean_axis(Axis(1))
            .ok_or_else(|| ArtifactError::Inconsistent("model has no outputs".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
