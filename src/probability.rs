//! Template matching: Mahalanobis log-likelihood of each key hypothesis.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::Error;

/// Compute the unnormalized log-probability of each key hypothesis.
///
/// For each hypothesis `k` and each trace `t` whose predicted group `predictions[[k, t]]` has a
/// template, the score of `k` accumulates `-0.5 · dᵀ·Σ⁻¹·d` where `d` is the deviation of the trace
/// from the template mean. Hypotheses that never hit a template score `-inf`.
///
/// * `leakages` - One row per trace, one column per selected sample
/// * `means` - One row per group over the selected samples, NaN rows for empty groups
/// * `inverse_covariance` - Inverse of the pooled covariance over the selected samples
/// * `predictions` - One row per hypothesis, one column per trace
///
/// # Errors
/// Returns [`Error::Internal`] if the shapes of the inputs are inconsistent.
pub fn log_probabilities(
    leakages: ArrayView2<f64>,
    means: ArrayView2<f64>,
    inverse_covariance: ArrayView2<f64>,
    predictions: ArrayView2<usize>,
) -> Result<Array1<f64>, Error> {
    let (trace_count, size) = leakages.dim();
    if predictions.shape()[1] != trace_count
        || means.shape()[1] != size
        || inverse_covariance.dim() != (size, size)
    {
        return Err(Error::Internal(format!(
            "inconsistent shapes: leakages {:?}, means {:?}, inverse covariance {:?}, predictions {:?}",
            leakages.shape(),
            means.shape(),
            inverse_covariance.shape(),
            predictions.shape()
        )));
    }

    let defined: Vec<bool> = means
        .rows()
        .into_iter()
        .map(|mean| mean.iter().all(|x| !x.is_nan()))
        .collect();

    Ok(predictions
        .rows()
        .into_iter()
        .map(|hypothesis| {
            hypothesis_log_probability(leakages, means, inverse_covariance, hypothesis, &defined)
        })
        .collect())
}

fn hypothesis_log_probability(
    leakages: ArrayView2<f64>,
    means: ArrayView2<f64>,
    inverse_covariance: ArrayView2<f64>,
    groups: ArrayView1<usize>,
    defined: &[bool],
) -> f64 {
    let traces: Vec<usize> = (0..groups.len())
        .filter(|&t| defined.get(groups[t]).copied().unwrap_or(false))
        .collect();
    if traces.is_empty() {
        return f64::NEG_INFINITY;
    }

    let trace_groups: Vec<usize> = traces.iter().map(|&t| groups[t]).collect();
    let deviations: Array2<f64> =
        leakages.select(Axis(0), &traces) - means.select(Axis(0), &trace_groups);

    // Row-wise quadratic forms dᵀ·Σ⁻¹·d
    let weighted = deviations.dot(&inverse_covariance);
    let distances = (weighted * &deviations).sum_axis(Axis(1));

    -0.5 * distances.sum()
}

#[cfg(test)]
mod tests {
    use super::log_probabilities;
    use crate::error::ErrorKind;
    use ndarray::{array, Array2};

    const NAN: f64 = f64::NAN;

    #[test]
    fn test_log_probabilities() {
        let leakages = array![[1.0, 0.0], [3.0, 2.0]];
        let means = array![[0.0, 0.0], [3.0, 1.0], [NAN, NAN]];
        let inverse = array![[1.0, 0.0], [0.0, 4.0]];
        let predictions = array![[0usize, 1], [1, 0], [2, 2], [2, 1]];

        let scores = log_probabilities(
            leakages.view(),
            means.view(),
            inverse.view(),
            predictions.view(),
        )
        .unwrap();

        // Hypothesis 0: d = (1, 0) -> 1, d = (0, 1) -> 4
        assert_eq!(scores[0], -2.5);
        // Hypothesis 1: d = (-2, -1) -> 8, d = (3, 2) -> 25
        assert_eq!(scores[1], -16.5);
        // Hypothesis 2 only hits the empty group
        assert_eq!(scores[2], f64::NEG_INFINITY);
        // Hypothesis 3: first trace skipped
        assert_eq!(scores[3], -2.0);
    }

    #[test]
    fn test_inconsistent_shapes() {
        let leakages = Array2::<f64>::zeros((2, 2));
        let means = Array2::<f64>::zeros((256, 2));
        let inverse = Array2::<f64>::eye(3);
        let predictions = Array2::<usize>::zeros((256, 2));

        assert_eq!(
            log_probabilities(
                leakages.view(),
                means.view(),
                inverse.view(),
                predictions.view()
            )
            .unwrap_err()
            .kind(),
            ErrorKind::Internal
        );
    }
}
