//! Kling-Gupta skill score and the loss derived from it.
//!
//! The skill score decomposes agreement into correlation `r`, variability
//! ratio `v = σp/σa` and bias ratio `b = μp/μa`:
//!
//! ```text
//! kge  = 1 − sqrt((r−1)² + (v−1)² + (b−1)²)
//! loss = 1 − kge
//! ```
//!
//! Perfect agreement gives loss 0; the loss is unbounded above. All
//! statistics are population statistics (divide by n).
//!
//! Reference: Gupta, Kling, Yilmaz & Martinez (2009), Journal of Hydrology
//! 377(1–2), 80–91.

use ndarray::{Array1, ArrayView1};

use crate::model::NumericError;

/// Spread or mean below this is treated as zero.
pub const EPSILON: f64 = 1e-12;

/// Everything computed for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkillComponents {
    pub correlation: f64,
    pub variability_ratio: f64,
    pub bias_ratio: f64,
    pub kge: f64,
}

impl SkillComponents {
    pub fn loss(&self) -> f64 {
        1.0 - self.kge
    }
}

struct Moments {
    n: f64,
    mean_actual: f64,
    mean_predicted: f64,
    std_actual: f64,
    std_predicted: f64,
    covariance: f64,
}

/// Validate inputs and collect the moments every term needs.
///
/// Zero spread in either vector, or a zero actual mean, makes a ratio
/// undefined; those come back as errors instead of NaN.
fn moments(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<Moments, NumericError> {
    if actual.len() != predicted.len() {
        return Err(NumericError::LengthMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }
    if actual.is_empty() {
        return Err(NumericError::EmptyInput);
    }
    if actual.iter().chain(predicted.iter()).any(|v| !v.is_finite()) {
        return Err(NumericError::NonFinite("input"));
    }

    let n = actual.len() as f64;
    let mean_actual = actual.sum() / n;
    let mean_predicted = predicted.sum() / n;

    let mut var_actual = 0.0;
    let mut var_predicted = 0.0;
    let mut covariance = 0.0;
    for (a, p) in actual.iter().zip(predicted.iter()) {
        let da = a - mean_actual;
        let dp = p - mean_predicted;
        var_actual += da * da;
        var_predicted += dp * dp;
        covariance += da * dp;
    }

    let std_actual = (var_actual / n).sqrt();
    let std_predicted = (var_predicted / n).sqrt();

    if std_actual < EPSILON {
        return Err(NumericError::ZeroVariance("actual"));
    }
    if std_predicted < EPSILON {
        return Err(NumericError::ZeroVariance("predicted"));
    }
    if mean_actual.abs() < EPSILON {
        return Err(NumericError::ZeroMean);
    }

    Ok(Moments {
        n,
        mean_actual,
        mean_predicted,
        std_actual,
        std_predicted,
        covariance: covariance / n,
    })
}

fn components(m: &Moments) -> SkillComponents {
    let correlation = m.covariance / (m.std_actual * m.std_predicted);
    let variability_ratio = m.std_predicted / m.std_actual;
    let bias_ratio = m.mean_predicted / m.mean_actual;

    let distance = ((correlation - 1.0).powi(2)
        + (variability_ratio - 1.0).powi(2)
        + (bias_ratio - 1.0).powi(2))
    .sqrt();

    SkillComponents {
        correlation,
        variability_ratio,
        bias_ratio,
        kge: 1.0 - distance,
    }
}

/// Skill score components for one batch.
pub fn skill_components(
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> Result<SkillComponents, NumericError> {
    let m = moments(actual, predicted)?;
    let c = components(&m);
    if !c.kge.is_finite() {
        return Err(NumericError::NonFinite("skill score"));
    }
    Ok(c)
}

/// Kling-Gupta efficiency.
pub fn kge(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError> {
    skill_components(actual, predicted).map(|c| c.kge)
}

/// `1 − kge`, the quantity minimized during training.
pub fn kge_loss(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError> {
    skill_components(actual, predicted).map(|c| c.loss())
}

/// Loss and its gradient with respect to each prediction.
///
/// With `L = sqrt(S)` and `S` the sum of the three squared terms:
///
/// ```text
/// ∂r/∂pᵢ = (aᵢ' / (σa σp) − r pᵢ' / σp²) / n
/// ∂v/∂pᵢ = pᵢ' / (n σp σa)
/// ∂b/∂pᵢ = 1 / (n μa)
/// ∂L/∂pᵢ = ((r−1) ∂r + (v−1) ∂v + (b−1) ∂b) / L
/// ```
///
/// At the optimum (`L = 0`) the gradient is zero.
pub fn kge_loss_gradient(
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> Result<(f64, Array1<f64>), NumericError> {
    let m = moments(actual, predicted)?;
    let c = components(&m);
    let loss = c.loss();
    if !loss.is_finite() {
        return Err(NumericError::NonFinite("loss"));
    }
    if loss < EPSILON {
        return Ok((loss, Array1::zeros(predicted.len())));
    }

    let r_term = c.correlation - 1.0;
    let v_term = c.variability_ratio - 1.0;
    let b_term = c.bias_ratio - 1.0;
    let sa_sp = m.std_actual * m.std_predicted;
    let sp2 = m.std_predicted * m.std_predicted;

    let gradient = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| {
            let da = a - m.mean_actual;
            let dp = p - m.mean_predicted;
            let dr = (da / sa_sp - c.correlation * dp / sp2) / m.n;
            let dv = dp / (m.n * sa_sp);
            let db = 1.0 / (m.n * m.mean_actual);
            (r_term * dr + v_term * dv + b_term * db) / loss
        })
        .collect::<Array1<f64>>();

    if gradient.iter().any(|g| !g.is_finite()) {
        return Err(NumericError::NonFinite("gradient"));
    }
    Ok((loss, gradient))
}

// ---------------------------------------------------------------------------
// Objective seam
// ---------------------------------------------------------------------------

/// A differentiable batch objective, as handed to the model factory.
pub trait Objective: Send + Sync {
    fn name(&self) -> &'static str;

    fn value(&self, actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError>;

    fn value_and_gradient(
        &self,
        actual: ArrayView1<f64>,
        predicted: ArrayView1<f64>,
    ) -> Result<(f64, Array1<f64>), NumericError>;
}

/// `1 − kge` as a training objective.
#[derive(Debug, Clone, Copy, Default)]
pub struct KgeLoss;

impl Objective for KgeLoss {
    fn name(&self) -> &'static str {
        "kge_loss"
    }

    fn value(&self, actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError> {
        kge_loss(actual, predicted)
    }

    fn value_and_gradient(
        &self,
        actual: ArrayView1<f64>,
        predicted: ArrayView1<f64>,
    ) -> Result<(f64, Array1<f64>), NumericError> {
        kge_loss_gradient(actual, predicted)
    }
}

/// Metric reported alongside the loss; value only.
pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;
    fn value(&self, actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError>;
}

/// The skill score itself (higher is better, 1 is perfect).
#[derive(Debug, Clone, Copy, Default)]
pub struct KgeMetric;

impl Metric for KgeMetric {
    fn name(&self) -> &'static str {
        "kge"
    }

    fn value(&self, actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Result<f64, NumericError> {
        kge(actual, predicted)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identical_vectors_give_zero_loss() {
        let a = array![0.2, 0.5, 0.9, 0.4, 0.7];
        assert_relative_eq!(kge_loss(a.view(), a.view()).unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(kge(a.view(), a.view()).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_anti_correlated_prediction_loss_exceeds_one() {
        let a = array![0.1, 0.3, 0.5, 0.7, 0.9];
        let p = array![0.9, 0.7, 0.5, 0.3, 0.1];
        let c = skill_components(a.view(), p.view()).unwrap();
        assert_relative_eq!(c.correlation, -1.0, epsilon = 1e-12);
        // (r-1)^2 = 4 with v = b = 1, so loss = 2
        assert_relative_eq!(c.loss(), 2.0, epsilon = 1e-12);
        assert!(c.loss() > 1.0);
    }

    #[test]
    fn test_components_for_scaled_and_shifted_prediction() {
        let a = array![1.0, 2.0, 3.0, 4.0];
        // p = 2a: r = 1, v = 2, b = 2
        let p = a.mapv(|v| 2.0 * v);
        let c = skill_components(a.view(), p.view()).unwrap();
        assert_relative_eq!(c.correlation, 1.0, epsilon = 1e-12);
        assert_relative_eq!(c.variability_ratio, 2.0, epsilon = 1e-12);
        assert_relative_eq!(c.bias_ratio, 2.0, epsilon = 1e-12);
        assert_relative_eq!(c.kge, 1.0 - 2f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_constant_actual_is_degenerate() {
        let a = array![0.5, 0.5, 0.5];
        let p = array![0.1, 0.2, 0.3];
        assert_eq!(
            kge_loss(a.view(), p.view()).unwrap_err(),
            NumericError::ZeroVariance("actual")
        );
    }

    #[test]
    fn test_constant_prediction_is_degenerate() {
        let a = array![0.1, 0.2, 0.3];
        let p = array![0.4, 0.4, 0.4];
        let err = kge_loss_gradient(a.view(), p.view()).unwrap_err();
        assert_eq!(err, NumericError::ZeroVariance("predicted"));
        assert!(err.is_degenerate_batch());
    }

    #[test]
    fn test_zero_mean_actual_is_degenerate() {
        let a = array![-1.0, 0.0, 1.0];
        let p = array![-0.5, 0.1, 0.9];
        assert_eq!(kge(a.view(), p.view()).unwrap_err(), NumericError::ZeroMean);
    }

    #[test]
    fn test_length_mismatch_and_empty_input() {
        let a = array![0.1, 0.2];
        let p = array![0.1];
        assert!(matches!(
            kge(a.view(), p.view()),
            Err(NumericError::LengthMismatch { actual: 2, predicted: 1 })
        ));

        let empty = Array1::<f64>::zeros(0);
        assert_eq!(kge(empty.view(), empty.view()).unwrap_err(), NumericError::EmptyInput);
    }

    #[test]
    fn test_nan_input_is_rejected() {
        let a = array![0.1, f64::NAN, 0.3];
        let p = array![0.1, 0.2, 0.3];
        assert_eq!(kge(a.view(), p.view()).unwrap_err(), NumericError::NonFinite("input"));
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let a = array![0.12, 0.48, 0.33, 0.91, 0.67, 0.25];
        let p = array![0.30, 0.41, 0.52, 0.70, 0.44, 0.18];

        let (loss, gradient) = kge_loss_gradient(a.view(), p.view()).unwrap();
        assert_relative_eq!(loss, kge_loss(a.view(), p.view()).unwrap());

        let h = 1e-6;
        for i in 0..p.len() {
            let mut up = p.clone();
            let mut down = p.clone();
            up[i] += h;
            down[i] -= h;
            let numeric = (kge_loss(a.view(), up.view()).unwrap()
                - kge_loss(a.view(), down.view()).unwrap())
                / (2.0 * h);
            assert_relative_eq!(gradient[i], numeric, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_gradient_is_zero_at_optimum() {
        let a = array![0.2, 0.4, 0.8];
        let (loss, gradient) = kge_loss_gradient(a.view(), a.view()).unwrap();
        assert_relative_eq!(loss, 0.0, epsilon = 1e-12);
        assert!(gradient.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_objective_and_metric_agree() {
        let a = array![0.3, 0.6, 0.2, 0.9];
        let p = array![0.35, 0.5, 0.25, 0.8];
        let loss = KgeLoss.value(a.view(), p.view()).unwrap();
        let metric = KgeMetric.value(a.view(), p.view()).unwrap();
        assert_relative_eq!(loss, 1.0 - metric, epsilon = 1e-12);
        assert_eq!(KgeLoss.name(), "kge_loss");
        assert_eq!(KgeMetric.name(), "kge");
    }
}
