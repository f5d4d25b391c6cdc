//! Gaussian templates: traces grouped by predicted leakage value.
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use std::ops::Range;

use crate::{trace::TraceStore, Error};

/// Number of groups handled by [`Templates`], one per byte value.
pub const GROUP_COUNT: usize = 256;

/// Build the [`Templates`] of the given traces.
///
/// `labels[i]` is the predicted leakage value of the `i`-th trace.
///
/// # Errors
/// Returns [`Error::UnsupportedOperation`] if a label is not a byte value.
///
/// # Panics
/// Panic if `leakages.shape()[0] != labels.len()`.
pub fn templates(
    leakages: ArrayView2<f64>,
    labels: ArrayView1<usize>,
) -> Result<Templates, Error> {
    assert_eq!(leakages.shape()[0], labels.len());

    let mut templates = Templates::new(leakages.shape()[1]);
    for (trace, &label) in leakages.rows().into_iter().zip(labels.iter()) {
        templates.process(trace, label)?;
    }

    Ok(templates)
}

/// Check that every predicted value is a byte value.
///
/// # Errors
/// Returns [`Error::UnsupportedOperation`] on the first value out of `0..256`.
pub fn check_predictions(predictions: ArrayView2<usize>) -> Result<(), Error> {
    match predictions.iter().find(|&&value| value >= GROUP_COUNT) {
        Some(value) => Err(Error::UnsupportedOperation(format!(
            "predicted leakage {value} is not a byte value"
        ))),
        None => Ok(()),
    }
}

/// Copy the samples `window` of the first `trace_count` traces of `store`.
///
/// The result has one row per trace and one column per sample of the window.
pub fn window_leakages(
    store: &dyn TraceStore,
    window: Range<usize>,
    trace_count: usize,
) -> Result<Array2<f64>, Error> {
    let mut leakages = Array2::zeros((trace_count, window.len()));
    for (column, index) in window.enumerate() {
        let sample = store.sample(index)?;
        if sample.len() < trace_count {
            return Err(Error::Internal(format!(
                "sample {index} holds {} values, {trace_count} expected",
                sample.len()
            )));
        }
        leakages
            .column_mut(column)
            .assign(&sample.slice(s![..trace_count]));
    }

    Ok(leakages)
}

/// Processes traces to build per-group mean vectors.
#[derive(Debug, Clone)]
pub struct Templates {
    /// Sum of traces per group
    groups_sum: Array2<f64>,
    /// Number of traces per group
    groups_count: Array1<usize>,
    /// Group of each trace, in processing order
    trace_groups: Vec<usize>,
}

impl Templates {
    /// Create a new template builder.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    pub fn new(size: usize) -> Self {
        Self {
            groups_sum: Array2::zeros((GROUP_COUNT, size)),
            groups_count: Array1::zeros(GROUP_COUNT),
            trace_groups: Vec::new(),
        }
    }

    /// Add a trace to the given group.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedOperation`] if `group` is not a byte value.
    ///
    /// # Panics
    /// Panics in debug if the length of the trace is different from the size of [`Templates`].
    pub fn process(&mut self, trace: ArrayView1<f64>, group: usize) -> Result<(), Error> {
        debug_assert_eq!(trace.len(), self.size());

        if group >= GROUP_COUNT {
            return Err(Error::UnsupportedOperation(format!(
                "predicted leakage {group} is not a byte value"
            )));
        }

        let mut sum = self.groups_sum.row_mut(group);
        sum += &trace;
        self.groups_count[group] += 1;
        self.trace_groups.push(group);

        Ok(())
    }

    /// Return the mean vector of each group, one row per group.
    ///
    /// Rows of empty groups are filled with NaN.
    pub fn means(&self) -> Array2<f64> {
        let mut means = self.groups_sum.clone();
        for (mut mean, &count) in means.rows_mut().into_iter().zip(self.groups_count.iter()) {
            if count == 0 {
                mean.fill(f64::NAN);
            } else {
                mean /= count as f64;
            }
        }

        means
    }

    /// Return `true` if at least one trace belongs to `group`.
    pub fn is_defined(&self, group: usize) -> bool {
        group < GROUP_COUNT && self.groups_count[group] > 0
    }

    /// Return the non-empty groups, in ascending order.
    pub fn defined_groups(&self) -> Vec<usize> {
        (0..GROUP_COUNT).filter(|&g| self.is_defined(g)).collect()
    }

    /// Return the group of each trace, in processing order.
    pub fn trace_groups(&self) -> &[usize] {
        &self.trace_groups
    }

    /// Return the trace size handled.
    pub fn size(&self) -> usize {
        self.groups_sum.shape()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::{check_predictions, templates, window_leakages, Templates};
    use crate::{error::ErrorKind, trace::TraceDataset};
    use ndarray::{array, Array2};

    #[test]
    fn test_means() {
        let leakages = array![[1.0, 2.0], [3.0, 4.0], [10.0, 20.0], [5.0, 6.0]];
        let labels = array![7usize, 7, 200, 7];

        let templates = templates(leakages.view(), labels.view()).unwrap();
        let means = templates.means();
        assert_eq!(means.row(7), array![3.0, 4.0]);
        assert_eq!(means.row(200), array![10.0, 20.0]);
        assert!(means.row(0).iter().all(|x| x.is_nan()));
        assert_eq!(templates.defined_groups(), vec![7, 200]);
        assert_eq!(templates.trace_groups(), &[7, 7, 200, 7]);
    }

    #[test]
    fn test_trace_groups() {
        let labels = array![3usize, 1, 3, 0, 255, 1, 3];
        let leakages = Array2::zeros((labels.len(), 1));

        let templates = templates(leakages.view(), labels.view()).unwrap();
        assert_eq!(templates.trace_groups(), labels.as_slice().unwrap());
        assert_eq!(templates.defined_groups(), vec![0, 1, 3, 255]);
        assert!(templates.is_defined(255));
        assert!(!templates.is_defined(2));
        assert!(!templates.is_defined(256));
    }

    #[test]
    fn test_non_byte_label() {
        let leakages = array![[1.0], [2.0]];

        assert_eq!(
            templates(leakages.view(), array![1usize, 256].view())
                .unwrap_err()
                .kind(),
            ErrorKind::UnsupportedOperation
        );
        assert_eq!(
            check_predictions(array![[0usize, 300]].view())
                .unwrap_err()
                .kind(),
            ErrorKind::UnsupportedOperation
        );
        assert!(check_predictions(array![[0usize, 255]].view()).is_ok());
    }

    #[test]
    fn test_process() {
        let mut templates = Templates::new(2);
        templates.process(array![1.0, 2.0].view(), 4).unwrap();
        templates.process(array![3.0, 6.0].view(), 4).unwrap();
        templates.process(array![0.0, 1.0].view(), 9).unwrap();

        assert_eq!(templates.trace_groups(), &[4, 4, 9]);
        assert_eq!(templates.means().row(4), array![2.0, 4.0]);
        assert_eq!(templates.size(), 2);
        assert_eq!(
            templates
                .process(array![0.0, 1.0].view(), 256)
                .unwrap_err()
                .kind(),
            ErrorKind::UnsupportedOperation
        );
        assert_eq!(templates.trace_groups().len(), 3);
    }

    #[test]
    fn test_window_leakages() {
        let dataset = TraceDataset::new(
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]],
            array![[0u8], [0], [0]],
            vec![0],
        )
        .unwrap();

        assert_eq!(
            window_leakages(&dataset, 1..3, 2).unwrap(),
            array![[2.0, 3.0], [5.0, 6.0]]
        );
    }
}
