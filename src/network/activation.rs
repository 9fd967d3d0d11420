//! Elementwise activation functions.
//!
//! Derivatives are taken with respect to the pre-activation `z`, which
//! dense layers cache during the forward pass.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// sqrt(2/π), used by the tanh approximation of GELU.
const GELU_K: f64 = 0.797_884_560_802_865_4;
const GELU_C: f64 = 0.044_715;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationType {
    /// `z · σ(z)`
    Swish,
    /// Tanh approximation of the Gaussian error linear unit.
    Gelu,
    Relu,
    Linear,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl ActivationType {
    pub fn apply(self, z: f64) -> f64 {
        match self {
            ActivationType::Swish => z * sigmoid(z),
            ActivationType::Gelu => {
                let t = (GELU_K * (z + GELU_C * z.powi(3))).tanh();
                0.5 * z * (1.0 + t)
            }
            ActivationType::Relu => z.max(0.0),
            ActivationType::Linear => z,
        }
    }

    pub fn derivative(self, z: f64) -> f64 {
        match self {
            ActivationType::Swish => {
                let s = sigmoid(z);
                s + z * s * (1.0 - s)
            }
            ActivationType::Gelu => {
                let t = (GELU_K * (z + GELU_C * z.powi(3))).tanh();
                let inner = GELU_K * (1.0 + 3.0 * GELU_C * z * z);
                0.5 * (1.0 + t) + 0.5 * z * (1.0 - t * t) * inner
            }
            ActivationType::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ActivationType::Linear => 1.0,
        }
    }

    pub fn forward_batch(self, z: &Array2<f64>) -> Array2<f64> {
        z.mapv(|v| self.apply(v))
    }

    pub fn backward_batch(self, z: &Array2<f64>) -> Array2<f64> {
        z.mapv(|v| self.derivative(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_known_values() {
        assert_eq!(ActivationType::Swish.apply(0.0), 0.0);
        assert_relative_eq!(ActivationType::Swish.apply(2.0), 2.0 * sigmoid(2.0));
        assert_eq!(ActivationType::Gelu.apply(0.0), 0.0);
        // GELU approaches identity for large positive inputs
        assert_relative_eq!(ActivationType::Gelu.apply(6.0), 6.0, epsilon = 1e-6);
        assert_eq!(ActivationType::Relu.apply(-3.0), 0.0);
        assert_eq!(ActivationType::Linear.apply(-3.0), -3.0);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let h = 1e-6;
        for activation in [
            ActivationType::Swish,
            ActivationType::Gelu,
            ActivationType::Relu,
            ActivationType::Linear,
        ] {
            for z in [-2.5, -0.7, 0.3, 1.1, 3.0] {
                let numeric = (activation.apply(z + h) - activation.apply(z - h)) / (2.0 * h);
                assert_relative_eq!(activation.derivative(z), numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_serde_names_are_lowercase() {
        let json = serde_json::to_string(&ActivationType::Gelu).unwrap();
        assert_eq!(json, "\"gelu\"");
    }
}
