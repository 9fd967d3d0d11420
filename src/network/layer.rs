//! Dense (fully connected) layer: `output = activation(input · W + b)`.

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::activation::ActivationType;
use super::ModelError;

/// Weight and bias gradients for one layer.
#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `input_size × output_size`
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub activation: ActivationType,
    pub dropout_rate: f64,

    #[serde(skip)]
    last_input: Option<Array2<f64>>,
    #[serde(skip)]
    last_z: Option<Array2<f64>>,
    #[serde(skip)]
    dropout_mask: Option<Array2<f64>>,
}

impl DenseLayer {
    /// Xavier/Glorot uniform initialization from `rng`.
    pub fn new(input_size: usize, output_size: usize, activation: ActivationType, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        let weights = Array2::random_using((input_size, output_size), Uniform::new(-limit, limit), rng);

        Self {
            weights,
            biases: Array1::zeros(output_size),
            activation,
            dropout_rate: 0.0,
            last_input: None,
            last_z: None,
            dropout_mask: None,
        }
    }

    pub fn with_dropout(mut self, rate: f64) -> Self {
        self.dropout_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn input_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn pre_activation(&self, input: &Array2<f64>) -> Array2<f64> {
        let mut z = input.dot(&self.weights);
        z += &self.biases;
        z
    }

    /// Inference pass: no dropout, nothing cached.
    pub fn infer(&self, input: &Array2<f64>) -> Array2<f64> {
        self.activation.forward_batch(&self.pre_activation(input))
    }

    /// Training pass. Caches what [`DenseLayer::backward`] needs and
    /// applies inverted dropout drawn from `rng`.
    pub fn forward(&mut self, input: &Array2<f64>, rng: &mut StdRng) -> Array2<f64> {
        let z = self.pre_activation(input);
        let mut output = self.activation.forward_batch(&z);

        self.dropout_mask = if self.dropout_rate > 0.0 {
            let keep = 1.0 - self.dropout_rate;
            let mask = Array2::from_shape_fn(output.dim(), |_| {
                if rng.r#gen::<f64>() < keep { 1.0 / keep } else { 0.0 }
            });
            output *= &mask;
            Some(mask)
        } else {
            None
        };

        self.last_input = Some(input.clone());
        self.last_z = Some(z);
        output
    }

    /// Returns the gradient with respect to the layer input together with
    /// this layer's parameter gradients.
    pub fn backward(&self, output_gradient: &Array2<f64>) -> Result<(Array2<f64>, LayerGradients), ModelError> {
        let (input, z) = match (&self.last_input, &self.last_z) {
            (Some(input), Some(z)) => (input, z),
            _ => return Err(ModelError::BackwardBeforeForward),
        };

        let mut delta = match &self.dropout_mask {
            Some(mask) => output_gradient * mask,
            None => output_gradient.clone(),
        };
        delta *= &self.activation.backward_batch(z);

        let gradients = LayerGradients {
            weights: input.t().dot(&delta),
            biases: delta.sum_axis(Axis(0)),
        };
        let input_gradient = delta.dot(&self.weights.t());

        Ok((input_gradient, gradients))
    }

    /// Drop cached activations once a step is complete.
    pub fn clear_cache(&mut self) {
        self.last_input = None;
        self.last_z = None;
        self.dropout_mask = None;
    }
}
