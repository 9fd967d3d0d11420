/// Epoch loop for the compiled model.
///
/// Each epoch updates on every train batch in order, then scores every
/// validation batch with dropout off. A batch whose skill score is
/// undefined (constant targets or constant predictions) is skipped and
/// counted; anything else numeric aborts the run.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{self, Stage};
use crate::model::{NumericError, Partition};
use crate::network::{BatchScores, CompiledModel, ModelError};
use crate::partition::PartitionedDataset;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("epoch {epoch}: {source}")]
    Numeric {
        epoch: usize,
        #[source]
        source: NumericError,
    },
    #[error("epoch {epoch}: every train batch was degenerate")]
    NoUsableBatches { epoch: usize },
    #[error("train partition has no batches")]
    EmptyTrainPartition,
    #[error(transparent)]
    Model(ModelError),
}

impl TrainError {
    fn from_model(epoch: usize, err: ModelError) -> Self {
        match err {
            ModelError::Numeric(source) => TrainError::Numeric { epoch, source },
            other => TrainError::Model(other),
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based.
    pub epoch: usize,
    pub loss: f64,
    pub kge: f64,
    /// `None` when the validation partition produced no usable batch.
    pub val_loss: Option<f64>,
    pub val_kge: Option<f64>,
    /// Train and validation batches skipped this epoch.
    pub degenerate_batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    /// Set when a [`StopHandle`] ended the run early.
    pub interrupted: bool,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Epoch with the lowest validation loss.
    pub fn best_validation(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .filter(|r| r.val_loss.is_some())
            .min_by(|a, b| a.val_loss.partial_cmp(&b.val_loss).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn total_degenerate_batches(&self) -> usize {
        self.epochs.iter().map(|r| r.degenerate_batches).sum()
    }
}

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

/// Cloneable flag checked between batches.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Stop at the next batch boundary on Ctrl-C instead of killing the
    /// process, so the partial model is still saved. A process can
    /// install only one such handler.
    pub fn stop_on_interrupt(&self) -> Result<(), ctrlc::Error> {
        let handle = self.clone();
        ctrlc::set_handler(move || {
            logging::warn(Stage::Train, None, "interrupt received, stopping after the current batch");
            handle.stop();
        })
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Trainer {
    stop: StopHandle,
}

#[derive(Default)]
struct Tally {
    loss: f64,
    metric: f64,
    scored: usize,
    degenerate: usize,
}

impl Tally {
    fn add(&mut self, scores: BatchScores) {
        self.loss += scores.loss;
        self.metric += scores.metric;
        self.scored += 1;
    }

    fn means(&self) -> Option<(f64, f64)> {
        (self.scored > 0).then(|| (self.loss / self.scored as f64, self.metric / self.scored as f64))
    }
}

enum Pass {
    Complete(Tally),
    Interrupted,
}

impl Trainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_handle(stop: StopHandle) -> Self {
        Self { stop }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Train for `epochs` epochs. Returns the history so far, flagged
    /// `interrupted`, if the stop handle fires.
    pub fn fit(
        &self,
        model: &mut CompiledModel,
        data: &PartitionedDataset,
        epochs: usize,
    ) -> Result<TrainingHistory, TrainError> {
        if data.train.is_empty() {
            return Err(TrainError::EmptyTrainPartition);
        }

        logging::info(
            Stage::Train,
            None,
            &format!(
                "Training {} parameters for {} epochs ({} train / {} validation batches, objective {})",
                model.num_parameters(),
                epochs,
                data.train.batches.len(),
                data.validation.batches.len(),
                model.objective_name()
            ),
        );

        let mut history = TrainingHistory::default();

        for epoch in 1..=epochs {
            let train = match self.run_pass(epoch, &data.train, |features, targets| {
                model.train_batch(features, targets)
            })? {
                Pass::Complete(tally) => tally,
                Pass::Interrupted => return Ok(interrupted(history, epoch)),
            };

            let validation = match self.run_pass(epoch, &data.validation, |features, targets| {
                model.evaluate(features, targets)
            })? {
                Pass::Complete(tally) => tally,
                Pass::Interrupted => return Ok(interrupted(history, epoch)),
            };

            let (loss, kge) = train.means().ok_or(TrainError::NoUsableBatches { epoch })?;
            let val = validation.means();

            let record = EpochRecord {
                epoch,
                loss,
                kge,
                val_loss: val.map(|(l, _)| l),
                val_kge: val.map(|(_, k)| k),
                degenerate_batches: train.degenerate + validation.degenerate,
            };

            logging::debug(
                Stage::Train,
                None,
                &format!(
                    "epoch {}/{}: loss={:.5} kge={:.5} val_loss={} skipped={}",
                    epoch,
                    epochs,
                    record.loss,
                    record.kge,
                    record.val_loss.map_or("n/a".to_string(), |v| format!("{:.5}", v)),
                    record.degenerate_batches
                ),
            );

            history.epochs.push(record);
        }

        if let Some(last) = history.last() {
            logging::info(
                Stage::Train,
                None,
                &format!(
                    "Finished {} epochs: loss={:.5} kge={:.5} ({} degenerate batches skipped)",
                    history.epochs.len(),
                    last.loss,
                    last.kge,
                    history.total_degenerate_batches()
                ),
            );
        }

        Ok(history)
    }

    fn run_pass<F>(&self, epoch: usize, partition: &Partition, mut score: F) -> Result<Pass, TrainError>
    where
        F: FnMut(&ndarray::Array2<f64>, &ndarray::Array1<f64>) -> Result<BatchScores, ModelError>,
    {
        let mut tally = Tally::default();
        for (index, batch) in partition.batches.iter().enumerate() {
            if self.stop.is_stopped() {
                return Ok(Pass::Interrupted);
            }
            match score(&batch.features, &batch.targets) {
                Ok(scores) => tally.add(scores),
                Err(e) if e.is_degenerate_batch() => {
                    tally.degenerate += 1;
                    logging::warn(
                        Stage::Train,
                        None,
                        &format!("epoch {}: skipping batch {} ({})", epoch, index, e),
                    );
                }
                Err(e) => return Err(TrainError::from_model(epoch, e)),
            }
        }
        Ok(Pass::Complete(tally))
    }
}

fn interrupted(mut history: TrainingHistory, epoch: usize) -> TrainingHistory {
    logging::warn(
        Stage::Train,
        None,
        &format!(
            "Training interrupted during epoch {} after {} complete epochs",
            epoch,
            history.epochs.len()
        ),
    );
    history.interrupted = true;
    history
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{KgeLoss, KgeMetric};
    use crate::model::{Batch, ScaleVectors};
    use crate::network::{build_model, ActivationType, LayerSpec, ModelSpec, OptimizerConfig, Topology};
    use ndarray::{Array1, Array2, Axis};

    fn model() -> CompiledModel {
        let layer = |units| LayerSpec::new(units, ActivationType::Swish, 0.0);
        let spec = ModelSpec {
            input_width: 2,
            output_width: 1,
            topology: Topology {
                cross: vec![layer(4)],
                sequence: vec![layer(4)],
                trunk: vec![layer(4)],
                head: vec![layer(2)],
            },
            seed: Some(3),
        };
        let optimizer = OptimizerConfig {
            learning_rate: 0.01,
            ..OptimizerConfig::default()
        };
        build_model(spec, Box::new(KgeLoss), Box::new(KgeMetric), optimizer).unwrap()
    }

    fn batch(offset: usize, targets: Option<Array1<f64>>) -> Batch {
        let features = Array2::from_shape_fn((10, 2), |(i, j)| ((i + offset) * (j + 2) % 7) as f64 / 7.0);
        let targets = targets.unwrap_or_else(|| features.map_axis(Axis(1), |r| 0.1 + 0.6 * r[0] + 0.2 * r[1]));
        Batch {
            rows: (offset..offset + 10).collect(),
            features,
            targets,
        }
    }

    fn dataset(train: Vec<Batch>, validation: Vec<Batch>) -> PartitionedDataset {
        PartitionedDataset {
            train: Partition { batches: train },
            validation: Partition { batches: validation },
            scale: ScaleVectors {
                columns: vec!["a".into(), "b".into()],
                min: vec![0.0, 0.0],
                max: vec![1.0, 1.0],
            },
        }
    }

    #[test]
    fn test_fit_records_every_epoch() {
        let data = dataset(vec![batch(0, None), batch(10, None)], vec![batch(20, None)]);
        let mut model = model();
        let history = Trainer::new().fit(&mut model, &data, 5).unwrap();

        assert_eq!(history.epochs.len(), 5);
        assert!(!history.interrupted);
        assert_eq!(history.epochs[0].epoch, 1);
        for record in &history.epochs {
            assert!(record.loss.is_finite());
            assert!((record.loss - (1.0 - record.kge)).abs() < 1e-9);
            assert!(record.val_loss.is_some());
            assert_eq!(record.degenerate_batches, 0);
        }
        assert!(history.best_validation().is_some());
    }

    #[test]
    fn test_degenerate_batches_are_skipped_and_counted() {
        let constant = Some(Array1::from_elem(10, 0.4));
        let data = dataset(
            vec![batch(0, None), batch(10, constant.clone())],
            vec![batch(20, constant)],
        );
        let mut model = model();
        let history = Trainer::new().fit(&mut model, &data, 3).unwrap();

        assert_eq!(history.epochs.len(), 3);
        assert!(history.epochs.iter().all(|r| r.degenerate_batches == 2));
        assert!(history.epochs.iter().all(|r| r.val_loss.is_none()));
        assert_eq!(history.total_degenerate_batches(), 6);
    }

    #[test]
    fn test_all_degenerate_train_batches_is_an_error() {
        let data = dataset(vec![batch(0, Some(Array1::from_elem(10, 0.4)))], vec![]);
        let mut model = model();
        let err = Trainer::new().fit(&mut model, &data, 2).unwrap_err();
        assert!(matches!(err, TrainError::NoUsableBatches { epoch: 1 }));
    }

    #[test]
    fn test_non_finite_targets_abort() {
        let mut targets = batch(0, None).targets;
        targets[3] = f64::INFINITY;
        let data = dataset(vec![batch(0, Some(targets))], vec![]);
        let mut model = model();
        let err = Trainer::new().fit(&mut model, &data, 2).unwrap_err();
        assert!(matches!(err, TrainError::Numeric { epoch: 1, source: NumericError::NonFinite(_) }));
    }

    #[test]
    fn test_stop_handle_interrupts() {
        let data = dataset(vec![batch(0, None)], vec![]);
        let trainer = Trainer::new();
        trainer.stop_handle().stop();

        let mut model = model();
        let history = trainer.fit(&mut model, &data, 10).unwrap();
        assert!(history.interrupted);
        assert!(history.epochs.is_empty());
    }

    #[test]
    fn test_clone_stopped_from_another_thread_interrupts() {
        let data = dataset(vec![batch(0, None)], vec![]);
        let trainer = Trainer::new();
        let remote = trainer.stop_handle();
        std::thread::spawn(move || remote.stop()).join().unwrap();

        let mut model = model();
        let history = trainer.fit(&mut model, &data, 10).unwrap();
        assert!(history.interrupted);
    }

    #[test]
    fn test_interrupt_handler_installs_once() {
        let stop = StopHandle::new();
        stop.stop_on_interrupt().unwrap();
        assert!(!stop.is_stopped());
        assert!(matches!(
            StopHandle::new().stop_on_interrupt(),
            Err(ctrlc::Error::MultipleHandlers)
        ));
    }

    #[test]
    fn test_empty_train_partition() {
        let data = dataset(vec![], vec![batch(0, None)]);
        let mut model = model();
        assert!(matches!(
            Trainer::new().fit(&mut model, &data, 1),
            Err(TrainError::EmptyTrainPartition)
        ));
    }
}
