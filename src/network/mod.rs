//! Model factory
//!
//! Builds the stress-regression network and binds it to an objective, a
//! reported metric and an optimizer:
//! - `activation`: swish, gelu, relu, linear
//! - `layer`: dense layer with dropout and cached backprop state
//! - `optimizer`: SGD with momentum, Adam
//! - `graph`: the multi-branch topology
//! - `compiled`: the trainable, savable model handed to the trainer

mod activation;
mod compiled;
mod graph;
mod layer;
mod optimizer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loss::{Metric, Objective};
use crate::model::NumericError;

pub use activation::ActivationType;
pub use compiled::{BatchScores, CompiledModel, ModelSnapshot};
pub use graph::MultiBranchNet;
pub use layer::{DenseLayer, LayerGradients};
pub use optimizer::{Adam, Optimizer, Sgd};

/// Momentum used when SGD is selected.
pub const SGD_MOMENTUM: f64 = 0.9;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model spec: {0}")]
    InvalidSpec(String),
    #[error("expected {expected} input columns, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("{features} feature rows but {targets} targets")]
    BatchMismatch { features: usize, targets: usize },
    #[error("backward pass requested before a forward pass")]
    BackwardBeforeForward,
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Numeric(#[from] NumericError),
}

impl ModelError {
    /// The batch itself was degenerate; the model is fine.
    pub fn is_degenerate_batch(&self) -> bool {
        matches!(self, ModelError::Numeric(e) if e.is_degenerate_batch())
    }
}

// ---------------------------------------------------------------------------
// Optimizer selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerAlgorithm {
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub algorithm: OptimizerAlgorithm,
    pub learning_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Adam,
            learning_rate: 0.000142,
        }
    }
}

impl OptimizerConfig {
    /// A fresh optimizer instance for one layer.
    pub fn instantiate(&self) -> Box<dyn Optimizer> {
        match self.algorithm {
            OptimizerAlgorithm::Adam => Box::new(Adam::new(self.learning_rate)),
            OptimizerAlgorithm::Sgd => Box::new(Sgd::new(self.learning_rate).with_momentum(SGD_MOMENTUM)),
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub units: usize,
    pub activation: ActivationType,
    pub dropout: f64,
}

impl LayerSpec {
    pub const fn new(units: usize, activation: ActivationType, dropout: f64) -> Self {
        Self {
            units,
            activation,
            dropout,
        }
    }
}

/// Hidden-layer layout. The output layer is always linear with
/// `output_width` units and is not listed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub cross: Vec<LayerSpec>,
    pub sequence: Vec<LayerSpec>,
    pub trunk: Vec<LayerSpec>,
    pub head: Vec<LayerSpec>,
}

impl Default for Topology {
    fn default() -> Self {
        use ActivationType::{Gelu, Swish};
        Self {
            cross: vec![LayerSpec::new(512, Swish, 0.45), LayerSpec::new(256, Swish, 0.3)],
            sequence: vec![LayerSpec::new(792, Swish, 0.45), LayerSpec::new(512, Gelu, 0.45)],
            trunk: vec![
                LayerSpec::new(768, Swish, 0.4),
                LayerSpec::new(384, Swish, 0.4),
                LayerSpec::new(256, Swish, 0.4),
            ],
            head: vec![LayerSpec::new(128, Swish, 0.3), LayerSpec::new(64, Gelu, 0.0)],
        }
    }
}

impl Topology {
    /// Same shape with every width divided by `factor` (minimum 1).
    pub fn scaled_down(&self, factor: usize) -> Self {
        let factor = factor.max(1);
        let shrink = |layers: &[LayerSpec]| -> Vec<LayerSpec> {
            layers
                .iter()
                .map(|l| LayerSpec {
                    units: (l.units / factor).max(1),
                    ..l.clone()
                })
                .collect()
        };
        Self {
            cross: shrink(&self.cross),
            sequence: shrink(&self.sequence),
            trunk: shrink(&self.trunk),
            head: shrink(&self.head),
        }
    }

    fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.cross
            .iter()
            .chain(&self.sequence)
            .chain(&self.trunk)
            .chain(&self.head)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub input_width: usize,
    pub output_width: usize,
    pub topology: Topology,
    /// Seeds weight initialization and dropout masks.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ModelSpec {
    pub fn new(input_width: usize, output_width: usize) -> Self {
        Self {
            input_width,
            output_width,
            topology: Topology::default(),
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.input_width == 0 {
            return Err(ModelError::InvalidSpec("input_width must be positive".to_string()));
        }
        if self.output_width == 0 {
            return Err(ModelError::InvalidSpec("output_width must be positive".to_string()));
        }
        for layer in self.topology.layers() {
            if layer.units == 0 {
                return Err(ModelError::InvalidSpec("layer with zero units".to_string()));
            }
            if !(0.0..1.0).contains(&layer.dropout) {
                return Err(ModelError::InvalidSpec(format!(
                    "dropout {} outside [0, 1)",
                    layer.dropout
                )));
            }
        }
        Ok(())
    }
}

/// Build and compile a model ready for training.
pub fn build_model(
    spec: ModelSpec,
    objective: Box<dyn Objective>,
    metric: Box<dyn Metric>,
    optimizer: OptimizerConfig,
) -> Result<CompiledModel, ModelError> {
    spec.validate()?;
    if !(optimizer.learning_rate.is_finite() && optimizer.learning_rate > 0.0) {
        return Err(ModelError::InvalidSpec(format!(
            "learning rate {} must be positive",
            optimizer.learning_rate
        )));
    }
    Ok(CompiledModel::new(spec, objective, metric, optimizer))
}
