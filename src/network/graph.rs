//! Multi-branch dense network.
//!
//! ```text
//!            ┌── cross branch ──┐
//! input ─────┼── sequence branch┼── concat(cross, seq, input) ── trunk ──┐
//!   │        └──────────────────┘                                        │
//!   └──────────────────────────────── concat(trunk, input) ── head ── output
//! ```
//!
//! Concatenations are along the feature axis, so the backward pass splits
//! the incoming gradient by column range. Gradients flowing back into the
//! raw input are discarded.

use ndarray::{concatenate, s, Array2, Axis};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layer::{DenseLayer, LayerGradients};
use super::{ActivationType, LayerSpec, ModelError, Topology};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiBranchNet {
    input_width: usize,
    cross: Vec<DenseLayer>,
    sequence: Vec<DenseLayer>,
    trunk: Vec<DenseLayer>,
    head: Vec<DenseLayer>,
    output: DenseLayer,
}

fn build_stack(input_width: usize, specs: &[LayerSpec], rng: &mut StdRng) -> (Vec<DenseLayer>, usize) {
    let mut width = input_width;
    let layers = specs
        .iter()
        .map(|spec| {
            let layer = DenseLayer::new(width, spec.units, spec.activation, rng).with_dropout(spec.dropout);
            width = spec.units;
            layer
        })
        .collect();
    (layers, width)
}

fn stack_width(layers: &[DenseLayer], input_width: usize) -> usize {
    layers.last().map_or(input_width, DenseLayer::output_size)
}

fn infer_stack(layers: &[DenseLayer], input: &Array2<f64>) -> Array2<f64> {
    layers.iter().fold(input.clone(), |x, layer| layer.infer(&x))
}

fn forward_stack(layers: &mut [DenseLayer], input: &Array2<f64>, rng: &mut StdRng) -> Array2<f64> {
    layers.iter_mut().fold(input.clone(), |x, layer| layer.forward(&x, rng))
}

/// Backpropagates through a stack; gradients are returned in layer order.
fn backward_stack(layers: &[DenseLayer], gradient: Array2<f64>) -> Result<(Array2<f64>, Vec<LayerGradients>), ModelError> {
    let mut gradient = gradient;
    let mut grads = Vec::with_capacity(layers.len());
    for layer in layers.iter().rev() {
        let (input_grad, layer_grads) = layer.backward(&gradient)?;
        grads.push(layer_grads);
        gradient = input_grad;
    }
    grads.reverse();
    Ok((gradient, grads))
}

impl MultiBranchNet {
    pub fn new(input_width: usize, output_width: usize, topology: &Topology, rng: &mut StdRng) -> Self {
        let (cross, cross_width) = build_stack(input_width, &topology.cross, rng);
        let (sequence, seq_width) = build_stack(input_width, &topology.sequence, rng);
        let (trunk, trunk_width) = build_stack(cross_width + seq_width + input_width, &topology.trunk, rng);
        let (head, head_width) = build_stack(trunk_width + input_width, &topology.head, rng);
        let output = DenseLayer::new(head_width, output_width, ActivationType::Linear, rng);

        Self {
            input_width,
            cross,
            sequence,
            trunk,
            head,
            output,
        }
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn output_width(&self) -> usize {
        self.output.output_size()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers().map(DenseLayer::num_parameters).sum()
    }

    /// Every layer in update order: cross, sequence, trunk, head, output.
    pub fn layers(&self) -> impl Iterator<Item = &DenseLayer> {
        self.cross
            .iter()
            .chain(&self.sequence)
            .chain(&self.trunk)
            .chain(&self.head)
            .chain(std::iter::once(&self.output))
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut DenseLayer> {
        self.cross
            .iter_mut()
            .chain(&mut self.sequence)
            .chain(&mut self.trunk)
            .chain(&mut self.head)
            .chain(std::iter::once(&mut self.output))
    }

    fn check_input(&self, input: &Array2<f64>) -> Result<(), ModelError> {
        if input.ncols() != self.input_width {
            return Err(ModelError::ShapeMismatch {
                expected: self.input_width,
                actual: input.ncols(),
            });
        }
        Ok(())
    }

    /// Deterministic prediction, dropout disabled.
    pub fn infer(&self, input: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        self.check_input(input)?;
        let cross = infer_stack(&self.cross, input);
        let seq = infer_stack(&self.sequence, input);
        let merged = concatenate(Axis(1), &[cross.view(), seq.view(), input.view()])?;
        let trunk = infer_stack(&self.trunk, &merged);
        let merged = concatenate(Axis(1), &[trunk.view(), input.view()])?;
        let head = infer_stack(&self.head, &merged);
        Ok(self.output.infer(&head))
    }

    /// Training-mode forward pass; caches activations for [`MultiBranchNet::backward`].
    pub fn forward(&mut self, input: &Array2<f64>, rng: &mut StdRng) -> Result<Array2<f64>, ModelError> {
        self.check_input(input)?;
        let cross = forward_stack(&mut self.cross, input, rng);
        let seq = forward_stack(&mut self.sequence, input, rng);
        let merged = concatenate(Axis(1), &[cross.view(), seq.view(), input.view()])?;
        let trunk = forward_stack(&mut self.trunk, &merged, rng);
        let merged = concatenate(Axis(1), &[trunk.view(), input.view()])?;
        let head = forward_stack(&mut self.head, &merged, rng);
        Ok(self.output.forward(&head, rng))
    }

    /// Parameter gradients for the last forward pass, in [`MultiBranchNet::layers`] order.
    pub fn backward(&self, output_gradient: &Array2<f64>) -> Result<Vec<LayerGradients>, ModelError> {
        let input_width = self.input_width;
        let cross_width = stack_width(&self.cross, input_width);
        let seq_width = stack_width(&self.sequence, input_width);
        let trunk_width = stack_width(&self.trunk, cross_width + seq_width + input_width);

        let (head_grad, output_grads) = self.output.backward(output_gradient)?;
        let (merged_grad, head_grads) = backward_stack(&self.head, head_grad)?;

        let trunk_grad = merged_grad.slice(s![.., ..trunk_width]).to_owned();
        let (merged_grad, trunk_grads) = backward_stack(&self.trunk, trunk_grad)?;

        let cross_grad = merged_grad.slice(s![.., ..cross_width]).to_owned();
        let seq_grad = merged_grad
            .slice(s![.., cross_width..cross_width + seq_width])
            .to_owned();
        let (_, cross_grads) = backward_stack(&self.cross, cross_grad)?;
        let (_, seq_grads) = backward_stack(&self.sequence, seq_grad)?;

        let mut grads = cross_grads;
        grads.extend(seq_grads);
        grads.extend(trunk_grads);
        grads.extend(head_grads);
        grads.push(output_grads);
        Ok(grads)
    }

    pub fn clear_cache(&mut self) {
        for layer in self.layers_mut() {
            layer.clear_cache();
        }
    }
}
