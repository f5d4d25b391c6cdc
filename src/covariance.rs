//! Pooled covariance of traces around their group means.
use ndarray::{Array2, ArrayView2, Axis};

use crate::Error;

/// Compute the pooled covariance matrix of `leakages` around their own group mean.
///
/// `leakages` has one row per trace and one column per selected sample, `means` one row per group
/// over the same samples, and `groups[i]` is the group of the `i`-th trace. The sum of the outer
/// products of the deviations is normalized by `trace_count - 1`.
///
/// # Errors
/// - Returns [`Error::NumericInstability`] with less than two traces.
/// - Returns [`Error::InvalidArgument`] if `leakages` contains NaN.
/// - Returns [`Error::Internal`] if a trace belongs to an empty group.
///
/// # Panics
/// Panic if `leakages.shape()[0] != groups.len()` or if `leakages` and `means` do not have the
/// same number of columns.
pub fn pooled_covariance(
    leakages: ArrayView2<f64>,
    means: ArrayView2<f64>,
    groups: &[usize],
) -> Result<Array2<f64>, Error> {
    assert_eq!(leakages.shape()[0], groups.len());
    assert_eq!(leakages.shape()[1], means.shape()[1]);

    let trace_count = leakages.shape()[0];
    if trace_count < 2 {
        return Err(Error::NumericInstability(format!(
            "cannot estimate a covariance from {trace_count} trace(s)"
        )));
    }

    if leakages.iter().any(|x| x.is_nan()) {
        return Err(Error::InvalidArgument(
            "trace data contains NaN samples".to_string(),
        ));
    }
    let trace_means = means.select(Axis(0), groups);
    if trace_means.iter().any(|x| x.is_nan()) {
        return Err(Error::Internal(
            "trace assigned to an empty leakage group".to_string(),
        ));
    }

    let deviations = &leakages - &trace_means;

    let scatter = deviations.t().dot(&deviations);
    let covariance = (&scatter + &scatter.t()) / (2.0 * (trace_count - 1) as f64);

    Ok(covariance)
}
