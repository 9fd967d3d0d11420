//! Trainable model bound to its objective, metric and optimizer state.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::graph::MultiBranchNet;
use super::optimizer::Optimizer;
use super::{ModelError, ModelSpec, OptimizerConfig};
use crate::loss::{Metric, Objective};

/// Loss and metric for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchScores {
    pub loss: f64,
    pub metric: f64,
}

/// Spec plus weights, the persisted form of a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub spec: ModelSpec,
    pub network: MultiBranchNet,
}

impl ModelSnapshot {
    /// The spec must be valid and agree with the stored weights.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.spec.validate()?;
        if self.network.input_width() != self.spec.input_width
            || self.network.output_width() != self.spec.output_width
        {
            return Err(ModelError::InvalidSpec(
                "saved weights do not match saved spec".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct CompiledModel {
    spec: ModelSpec,
    network: MultiBranchNet,
    objective: Box<dyn Objective>,
    metric: Box<dyn Metric>,
    optimizer_config: OptimizerConfig,
    /// One per layer, in `MultiBranchNet::layers` order.
    optimizers: Vec<Box<dyn Optimizer>>,
    rng: StdRng,
}

impl std::fmt::Debug for CompiledModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModel")
            .field("spec", &self.spec)
            .field("objective", &self.objective.name())
            .field("metric", &self.metric.name())
            .field("optimizer", &self.optimizer_config)
            .field("parameters", &self.network.num_parameters())
            .finish()
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl CompiledModel {
    pub(super) fn new(
        spec: ModelSpec,
        objective: Box<dyn Objective>,
        metric: Box<dyn Metric>,
        optimizer_config: OptimizerConfig,
    ) -> Self {
        let mut rng = rng_for(spec.seed);
        let network = MultiBranchNet::new(spec.input_width, spec.output_width, &spec.topology, &mut rng);

        let optimizers = network.layers().map(|_| optimizer_config.instantiate()).collect();
        Self {
            spec,
            network,
            objective,
            metric,
            optimizer_config,
            optimizers,
            rng,
        }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        self.optimizer_config
    }

    pub fn objective_name(&self) -> &'static str {
        self.objective.name()
    }

    pub fn metric_name(&self) -> &'static str {
        self.metric.name()
    }

    pub fn num_parameters(&self) -> usize {
        self.network.num_parameters()
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            spec: self.spec.clone(),
            network: self.network.clone(),
        }
    }

    /// `n × output_width` predictions with dropout disabled.
    pub fn predict(&self, features: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        self.network.infer(features)
    }

    /// Broadcast a single target column across every output and flatten
    /// row-major, matching `predictions.iter()` order.
    fn broadcast_targets(&self, predictions: &Array2<f64>, targets: &Array1<f64>) -> Result<Array1<f64>, ModelError> {
        if predictions.nrows() != targets.len() {
            return Err(ModelError::BatchMismatch {
                features: predictions.nrows(),
                targets: targets.len(),
            });
        }
        let width = predictions.ncols();
        Ok(targets.iter().flat_map(|t| std::iter::repeat(*t).take(width)).collect())
    }

    fn flatten(predictions: &Array2<f64>) -> Array1<f64> {
        predictions.iter().copied().collect()
    }

    fn scores(&self, actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<BatchScores, ModelError> {
        Ok(BatchScores {
            loss: self.objective.value(actual, predicted)?,
            metric: self.metric.value(actual, predicted)?,
        })
    }

    /// Score a batch without updating weights.
    pub fn evaluate(&self, features: &Array2<f64>, targets: &Array1<f64>) -> Result<BatchScores, ModelError> {
        let predictions = self.predict(features)?;
        let actual = self.broadcast_targets(&predictions, targets)?;
        self.scores(actual.view(), Self::flatten(&predictions).view())
    }

    /// One optimizer step on a batch. Scores are for the pre-update
    /// weights, with dropout active.
    ///
    /// On error no weights change.
    pub fn train_batch(&mut self, features: &Array2<f64>, targets: &Array1<f64>) -> Result<BatchScores, ModelError> {
        let predictions = self.network.forward(features, &mut self.rng)?;
        let result = self.step(&predictions, targets);
        self.network.clear_cache();
        result
    }

    fn step(&mut self, predictions: &Array2<f64>, targets: &Array1<f64>) -> Result<BatchScores, ModelError> {
        let actual = self.broadcast_targets(predictions, targets)?;
        let flat = Self::flatten(predictions);

        let (loss, gradient) = self.objective.value_and_gradient(actual.view(), flat.view())?;
        let metric = self.metric.value(actual.view(), flat.view())?;

        let output_gradient = gradient.into_shape(predictions.raw_dim())?;
        let gradients = self.network.backward(&output_gradient)?;

        for ((layer, optimizer), grads) in self
            .network
            .layers_mut()
            .zip(self.optimizers.iter_mut())
            .zip(gradients)
        {
            optimizer.update_weights(&mut layer.weights, &grads.weights);
            optimizer.update_biases(&mut layer.biases, &grads.biases);
        }

        Ok(BatchScores { loss, metric })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;
    use crate::loss::{KgeLoss, KgeMetric};
    use crate::network::{build_model, ActivationType, LayerSpec, Topology};
    use crate::model::NumericError;

    fn small_spec(output_width: usize) -> ModelSpec {
        let layer = |units| LayerSpec::new(units, ActivationType::Swish, 0.0);
        ModelSpec {
            input_width: 3,
            output_width,
            topology: Topology {
                cross: vec![layer(8)],
                sequence: vec![layer(8)],
                trunk: vec![layer(8)],
                head: vec![layer(4)],
            },
            seed: Some(42),
        }
    }

    fn compile(spec: ModelSpec, learning_rate: f64) -> CompiledModel {
        build_model(
            spec,
            Box::new(KgeLoss),
            Box::new(KgeMetric),
            OptimizerConfig {
                learning_rate,
                ..OptimizerConfig::default()
            },
        )
        .unwrap()
    }

    fn toy_batch() -> (Array2<f64>, Array1<f64>) {
        let features = Array2::from_shape_fn((32, 3), |(i, j)| ((i * 7 + j * 3) % 11) as f64 / 11.0);
        let targets = features.map_axis(Axis(1), |row| 0.2 + 0.5 * row[0] + 0.3 * row[2] * row[1]);
        (features, targets)
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = compile(small_spec(1), 0.01);
        let (features, targets) = toy_batch();

        let before = model.evaluate(&features, &targets).unwrap().loss;
        for _ in 0..200 {
            model.train_batch(&features, &targets).unwrap();
        }
        let after = model.evaluate(&features, &targets).unwrap().loss;
        assert!(after < before, "loss should fall: {} -> {}", before, after);
    }

    #[test]
    fn test_same_seed_same_predictions() {
        let (features, _) = toy_batch();
        let a = compile(small_spec(1), 0.001).predict(&features).unwrap();
        let b = compile(small_spec(1), 0.001).predict(&features).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_multi_output_broadcasts_target() {
        let model = compile(small_spec(3), 0.001);
        let (features, targets) = toy_batch();
        assert_eq!(model.predict(&features).unwrap().dim(), (32, 3));
        let scores = model.evaluate(&features, &targets).unwrap();
        assert!(scores.loss.is_finite());
        assert!((scores.loss - (1.0 - scores.metric)).abs() < 1e-12);
    }

    #[test]
    fn test_constant_targets_are_degenerate_and_leave_weights() {
        let mut model = compile(small_spec(1), 0.01);
        let (features, _) = toy_batch();
        let before = model.predict(&features).unwrap();

        let err = model
            .train_batch(&features, &Array1::from_elem(32, 0.5))
            .unwrap_err();
        assert!(matches!(err, ModelError::Numeric(NumericError::ZeroVariance("actual"))));
        assert!(err.is_degenerate_batch());
        assert_eq!(model.predict(&features).unwrap(), before);
    }

    #[test]
    fn test_batch_mismatch() {
        let model = compile(small_spec(1), 0.01);
        let (features, _) = toy_batch();
        let err = model.evaluate(&features, &Array1::zeros(5)).unwrap_err();
        assert!(matches!(err, ModelError::BatchMismatch { features: 32, targets: 5 }));
    }

    #[test]
    fn test_snapshot_round_trip_preserves_predictions() {
        let mut model = compile(small_spec(1), 0.01);
        let (features, targets) = toy_batch();
        for _ in 0..5 {
            model.train_batch(&features, &targets).unwrap();
        }

        let json = serde_json::to_string(&model.snapshot()).unwrap();
        let snapshot: ModelSnapshot = serde_json::from_str(&json).unwrap();
        snapshot.validate().unwrap();

        let original = model.predict(&features).unwrap();
        let reloaded = snapshot.network.infer(&features).unwrap();
        for (a, b) in original.iter().zip(reloaded.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
