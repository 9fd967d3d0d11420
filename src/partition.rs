//! Dataset partitioner and normalizer.
//!
//! Turns the joined corpus into batched train and validation partitions.
//! The order of operations is fixed:
//!
//! ```text
//! shuffle₁ → percentile scale → normalize → split → shuffle₂ (each) → batch
//! ```
//!
//! Scale statistics are taken over the whole corpus before the split, so
//! train and validation share one set of divisors, and those divisors
//! must travel with the trained model.

use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::logging::{self, Stage};
use crate::model::{
    Batch, Corpus, FEATURE_COUNT, Partition, PartitionError, ScaleVectors, feature_columns,
};

/// Lower robust bound, recorded but not applied.
pub const MIN_QUANTILE: f64 = 0.05;
/// Upper robust bound, used as the per-feature divisor.
pub const MAX_QUANTILE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub shuffle: bool,
    pub batch_size: usize,
    /// Share of rows, in percent, that go to the train partition.
    pub train_percent: f64,
    /// Makes both shuffle passes reproducible when set.
    pub seed: Option<u64>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            batch_size: 100,
            train_percent: 85.0,
            seed: None,
        }
    }
}

/// Output of [`partition_corpus`].
#[derive(Debug, Clone)]
pub struct PartitionedDataset {
    pub train: Partition,
    pub validation: Partition,
    pub scale: ScaleVectors,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Quantile of `values` with linear interpolation between order
/// statistics (`pos = q·(n−1)`). Returns `None` for an empty slice.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Per-column 5th and 95th percentiles of a feature matrix.
pub fn scale_vectors(features: &Array2<f64>) -> ScaleVectors {
    let mut min = Vec::with_capacity(features.ncols());
    let mut max = Vec::with_capacity(features.ncols());

    for column in features.axis_iter(Axis(1)) {
        let values = column.to_vec();
        min.push(quantile(&values, MIN_QUANTILE).unwrap_or(f64::NAN));
        max.push(quantile(&values, MAX_QUANTILE).unwrap_or(f64::NAN));
    }

    ScaleVectors {
        columns: feature_columns(),
        min,
        max,
    }
}

/// Divide each column by its 95th percentile. The 5th percentile is
/// deliberately not subtracted.
pub fn normalize(features: &mut Array2<f64>, scale: &ScaleVectors) -> Result<(), PartitionError> {
    for (i, &divisor) in scale.max.iter().enumerate() {
        if divisor == 0.0 || !divisor.is_finite() {
            return Err(PartitionError::DegenerateScale {
                column: scale.columns.get(i).cloned().unwrap_or_else(|| i.to_string()),
                value: divisor,
            });
        }
    }

    for mut row in features.axis_iter_mut(Axis(0)) {
        for (value, divisor) in row.iter_mut().zip(&scale.max) {
            *value /= divisor;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Number of rows in the train partition: `floor(percent/100 · n)`.
pub fn split_index(total: usize, train_percent: f64) -> usize {
    ((train_percent / 100.0) * total as f64).floor() as usize
}

fn batch_rows(
    rows: &[usize],
    features: &Array2<f64>,
    targets: &Array1<f64>,
    batch_size: usize,
) -> Partition {
    let batches = rows
        .chunks(batch_size)
        .map(|chunk| Batch {
            features: features.select(Axis(0), chunk),
            targets: targets.select(Axis(0), chunk),
            rows: chunk.to_vec(),
        })
        .collect();
    Partition { batches }
}

/// Shuffle, normalize, split and batch the corpus.
///
/// Row ids in the returned batches are corpus indices, so callers can map
/// any sample back to its site and time step.
pub fn partition_corpus(
    corpus: &Corpus,
    config: &PartitionConfig,
) -> Result<PartitionedDataset, PartitionError> {
    if !(0.0..=100.0).contains(&config.train_percent) {
        return Err(PartitionError::InvalidPercentage(config.train_percent));
    }
    if config.batch_size == 0 {
        return Err(PartitionError::InvalidBatchSize);
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let total = corpus.len();
    let mut order: Vec<usize> = (0..total).collect();
    if config.shuffle {
        logging::debug(Stage::Partition, None, "shuffling corpus");
        order.shuffle(&mut rng);
    }

    // Matrices are indexed by corpus row id; `order` carries the shuffle.
    let mut features = Array2::zeros((total, FEATURE_COUNT));
    let mut targets = Array1::zeros(total);
    for (i, row) in corpus.rows.iter().enumerate() {
        features.row_mut(i).assign(&Array1::from(row.features.to_vec()));
        targets[i] = row.target;
    }

    let scale = scale_vectors(&features);
    logging::debug(Stage::Partition, None, "normalizing features by 95th percentile");
    normalize(&mut features, &scale)?;

    let split = split_index(total, config.train_percent);
    let mut train_rows = order[..split].to_vec();
    let mut validation_rows = order[split..].to_vec();

    let empty = |which| PartitionError::EmptyPartition {
        which,
        total,
        percent: config.train_percent,
    };
    if train_rows.is_empty() {
        return Err(empty("train"));
    }
    if validation_rows.is_empty() {
        return Err(empty("validation"));
    }

    if config.shuffle {
        train_rows.shuffle(&mut rng);
        validation_rows.shuffle(&mut rng);
    }

    let train = batch_rows(&train_rows, &features, &targets, config.batch_size);
    let validation = batch_rows(&validation_rows, &features, &targets, config.batch_size);

    logging::info(
        Stage::Partition,
        None,
        &format!(
            "train: {} rows in {} batches, validation: {} rows in {} batches",
            train.len(),
            train.batches.len(),
            validation.len(),
            validation.batches.len()
        ),
    );

    Ok(PartitionedDataset {
        train,
        validation,
        scale,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
