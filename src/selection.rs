//! Selection of the samples used by the multivariate model.
use itertools::Itertools;
use ndarray::ArrayView2;

use crate::Error;

/// Select the samples where the group means differ.
///
/// `means` has one row per group and one column per sample; rows containing NaN are empty groups
/// and are ignored. A sample is kept as soon as one pair of groups has a non-zero squared mean
/// difference on it. Pairs are visited in ascending `(i, j)` order with `i < j` and samples in
/// ascending order within a pair, and samples are returned in the order they were first kept.
///
/// This is a coarse admission filter: on noisy floating point data nearly every sample passes, so
/// the result is not guaranteed to be smaller than the window.
///
/// # Errors
/// Returns [`Error::Internal`] if no sample is selected.
pub fn select_samples(means: ArrayView2<f64>) -> Result<Vec<usize>, Error> {
    let size = means.shape()[1];
    let groups: Vec<usize> = means
        .rows()
        .into_iter()
        .enumerate()
        .filter(|(_, mean)| mean.iter().all(|x| !x.is_nan()))
        .map(|(group, _)| group)
        .collect();

    let mut selected = Vec::new();
    let mut is_selected = vec![false; size];
    for (i, j) in groups.iter().tuple_combinations() {
        if selected.len() == size {
            break;
        }

        let (mean_i, mean_j) = (means.row(*i), means.row(*j));
        for sample in 0..size {
            if is_selected[sample] {
                continue;
            }

            let diff = mean_i[sample] - mean_j[sample];
            if diff * diff > 0.0 {
                is_selected[sample] = true;
                selected.push(sample);
            }
        }
    }

    if selected.is_empty() {
        return Err(Error::Internal(
            "no sample distinguishes the leakage groups".to_string(),
        ));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::select_samples;
    use crate::error::ErrorKind;
    use ndarray::array;

    const NAN: f64 = f64::NAN;

    #[test]
    fn test_first_occurrence_order() {
        let means = array![
            [1.0, 5.0, 2.0, 0.0],
            [NAN, NAN, NAN, NAN],
            [1.0, 5.0, 3.0, 0.0],
            [4.0, 5.0, 2.0, 0.0],
        ];

        // Pair (0, 2) selects sample 2, then pair (0, 3) selects sample 0.
        assert_eq!(select_samples(means.view()).unwrap(), vec![2, 0]);
    }

    #[test]
    fn test_no_duplicates() {
        let means = array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];

        assert_eq!(select_samples(means.view()).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_empty_selection() {
        let single_group = array![[1.0, 2.0], [NAN, NAN]];
        assert_eq!(
            select_samples(single_group.view()).unwrap_err().kind(),
            ErrorKind::Internal
        );

        let identical_groups = array![[1.0, 2.0], [1.0, 2.0]];
        assert_eq!(
            select_samples(identical_groups.view()).unwrap_err().kind(),
            ErrorKind::Internal
        );
    }
}
