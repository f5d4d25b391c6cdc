//! Template attack log-probabilities over increasing trace counts, for every key byte.
use ndarray::{s, Array1, Array3, ArrayView1, ArrayView3, Axis};
use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Write,
    ops::Range,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};
use tracing::{debug, error, info, warn};

#[cfg(feature = "progress_bar")]
use indicatif::ProgressBar;

use crate::{
    covariance::pooled_covariance,
    leakage_model::PowerModel,
    linalg::cholesky_inverse,
    probability::log_probabilities,
    selection::select_samples,
    template::{check_predictions, templates, window_leakages, GROUP_COUNT},
    trace::{KeyMode, TraceStore},
    util::{argmax_by, argsort_by},
    Error,
};

/// Parameters of a [`RankEstimation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankEstimationConfig {
    /// First sample of the window
    pub sample_start: usize,
    /// Excluded end of the sample window, defaults to the number of samples
    pub sample_end: Option<usize>,
    /// Number of traces to analyze, defaults to the number of traces of the dataset
    pub trace_count: Option<usize>,
    /// Stride between trace count checkpoints, `0` for a single checkpoint
    pub trace_step: usize,
    /// Number of histogram bins of the whole key rank estimation
    pub bin_count: usize,
    /// Number of worker threads, defaults to the global rayon pool
    pub num_threads: Option<usize>,
}

impl Default for RankEstimationConfig {
    fn default() -> Self {
        Self {
            sample_start: 0,
            sample_end: None,
            trace_count: None,
            trace_step: 0,
            bin_count: 10000,
            num_threads: None,
        }
    }
}

impl RankEstimationConfig {
    /// Load a [`RankEstimationConfig`] from a JSON file. Missing fields take their default value.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: RankEstimationConfig = serde_json::from_reader(file)?;

        Ok(config)
    }

    /// Save the [`RankEstimationConfig`] to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;

        Ok(())
    }
}

/// Return the trace count checkpoints.
///
/// With a zero `trace_step` the only checkpoint is `trace_count`, otherwise the checkpoints are
/// `trace_step, 2·trace_step, …` up to `trace_count` included.
pub fn steps(trace_count: usize, trace_step: usize) -> Vec<usize> {
    if trace_step == 0 {
        vec![trace_count]
    } else {
        (trace_step..=trace_count).step_by(trace_step).collect()
    }
}

/// Computes the log-probabilities of all key byte hypotheses for several trace counts.
///
/// Each `(trace count, key byte)` pair is an independent unit of work: templates are built from
/// the traces under the known key byte, then every hypothesis is scored against them. Units run in
/// parallel and are reassembled in order.
pub struct RankEstimation<'a, S, M> {
    store: &'a S,
    model: &'a M,
    key: Vec<u8>,
    window: Range<usize>,
    steps: Vec<usize>,
    bin_count: usize,
    num_threads: Option<usize>,
    /// Number of units computed successfully
    completed: AtomicUsize,
    #[cfg(feature = "progress_bar")]
    progress_bar: Option<ProgressBar>,
}

impl<'a, S, M> RankEstimation<'a, S, M>
where
    S: TraceStore,
    M: PowerModel,
{
    /// Validate the configuration against the dataset.
    ///
    /// # Errors
    /// - Returns [`Error::UnsupportedOperation`] if the dataset key is not fixed.
    /// - Returns [`Error::InvalidArgument`] if the sample window is empty or out of the dataset,
    ///   if the trace count exceeds the dataset, if the trace step exceeds the trace count, or on a
    ///   zero bin count or thread count.
    pub fn new(store: &'a S, model: &'a M, config: &RankEstimationConfig) -> Result<Self, Error> {
        let header = store.header();

        if header.key_mode != KeyMode::Fixed {
            error!("rank estimation requires the key to be fixed across the entire dataset");
            return Err(Error::UnsupportedOperation(
                "rank estimation requires a fixed key dataset".to_string(),
            ));
        }
        let key = store.key()?.to_vec();
        if key.len() != header.key_size {
            return Err(Error::Internal(format!(
                "key has {} bytes, header announces {}",
                key.len(),
                header.key_size
            )));
        }

        let sample_end = config.sample_end.unwrap_or(header.sample_count);
        if config.sample_start >= sample_end || sample_end > header.sample_count {
            return Err(Error::InvalidArgument(format!(
                "sample window {}..{} is empty or outside of 0..{}",
                config.sample_start, sample_end, header.sample_count
            )));
        }

        let trace_count = config.trace_count.unwrap_or(header.trace_count);
        if trace_count > header.trace_count {
            return Err(Error::InvalidArgument(format!(
                "trace count {} exceeds the {} traces of the dataset",
                trace_count, header.trace_count
            )));
        }
        let steps = steps(trace_count, config.trace_step);
        if steps.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "trace step {} exceeds the trace count {}",
                config.trace_step, trace_count
            )));
        }
        if config.bin_count == 0 {
            return Err(Error::InvalidArgument(
                "bin count must be positive".to_string(),
            ));
        }
        if config.num_threads == Some(0) {
            return Err(Error::InvalidArgument(
                "thread count must be positive".to_string(),
            ));
        }

        Ok(Self {
            store,
            model,
            key,
            window: config.sample_start..sample_end,
            steps,
            bin_count: config.bin_count,
            num_threads: config.num_threads,
            completed: AtomicUsize::new(0),
            #[cfg(feature = "progress_bar")]
            progress_bar: None,
        })
    }

    /// Report progress of the computation to the given [`ProgressBar`].
    #[cfg(feature = "progress_bar")]
    pub fn with_progress_bar(mut self, progress_bar: ProgressBar) -> Self {
        progress_bar.set_length(self.unit_count() as u64);
        self.progress_bar = Some(progress_bar);
        self
    }

    /// Return the trace count checkpoints.
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Return the analyzed sample window.
    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }

    /// Return the number of histogram bins reserved for the whole key rank estimation.
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Return the number of `(trace count, key byte)` units.
    pub fn unit_count(&self) -> usize {
        self.steps.len() * self.key.len()
    }

    /// Return the number of units computed successfully so far.
    pub fn completed_units(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    /// Compute the log-probabilities of the 256 hypotheses of `byte_index` using the first
    /// `trace_count` traces.
    ///
    /// # Errors
    /// - Returns [`Error::UnsupportedOperation`] if the power model predicts non byte values.
    /// - Returns [`Error::NumericInstability`] if the pooled covariance is not positive-definite.
    /// - Forwards power model and trace store errors.
    pub fn compute_unit(
        &self,
        trace_count: usize,
        byte_index: usize,
    ) -> Result<Array1<f64>, Error> {
        let Some(&key_byte) = self.key.get(byte_index) else {
            return Err(Error::InvalidArgument(format!(
                "key byte {byte_index} out of range"
            )));
        };

        let predictions = self.model.predictions(self.store, byte_index)?;
        if predictions.shape()[0] != GROUP_COUNT || predictions.shape()[1] < trace_count {
            return Err(Error::ModelError(format!(
                "prediction matrix has shape {:?}, at least [{GROUP_COUNT}, {trace_count}] expected",
                predictions.shape()
            )));
        }
        let predictions = predictions.slice(s![.., ..trace_count]);
        check_predictions(predictions)?;

        let leakages = window_leakages(self.store, self.window.clone(), trace_count)?;
        let templates = templates(leakages.view(), predictions.row(key_byte as usize))?;
        let means = templates.means();

        let selected = select_samples(means.view())?;
        let leakages = leakages.select(Axis(1), &selected);
        let means = means.select(Axis(1), &selected);

        let covariance =
            pooled_covariance(leakages.view(), means.view(), templates.trace_groups())?;
        let inverse_covariance = cholesky_inverse(covariance.view())?;
        let scores = log_probabilities(
            leakages.view(),
            means.view(),
            inverse_covariance.view(),
            predictions,
        )?;

        if scores.iter().any(|x| x.is_nan()) {
            return Err(Error::NumericInstability(format!(
                "log-probability is NaN for byte {byte_index} with {trace_count} traces"
            )));
        }

        debug!(
            trace_count,
            byte_index,
            groups = templates.defined_groups().len(),
            selected_samples = selected.len(),
            "unit computed"
        );

        Ok(scores)
    }

    /// Compute the log-probabilities of every key byte hypothesis at every trace count checkpoint.
    ///
    /// The first error stops the scheduling of new units and is returned once the running units
    /// complete; no partial result is returned.
    pub fn compute(&self) -> Result<LogProbabilities, Error> {
        let key_size = self.key.len();
        let unit_count = self.unit_count();
        info!(
            steps = self.steps.len(),
            key_size,
            window_start = self.window.start,
            window_end = self.window.end,
            threads = ?self.num_threads,
            "starting rank estimation"
        );

        let failed = AtomicBool::new(false);
        let skipped = AtomicUsize::new(0);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        let run = || -> Vec<Option<(usize, Array1<f64>)>> {
            (0..unit_count)
                .into_par_iter()
                .map(|unit| {
                    let (step_idx, byte_index) = (unit / key_size, unit % key_size);
                    if failed.load(Ordering::Acquire) {
                        debug!(
                            trace_count = self.steps[step_idx],
                            byte_index, "unit skipped after an earlier failure"
                        );
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }

                    match self.compute_unit(self.steps[step_idx], byte_index) {
                        Ok(scores) => {
                            self.unit_done();
                            Some((unit, scores))
                        }
                        Err(e) => {
                            error!(
                                trace_count = self.steps[step_idx],
                                byte_index,
                                error = %e,
                                "unit failed"
                            );
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(e);
                            }
                            failed.store(true, Ordering::Release);
                            None
                        }
                    }
                })
                .collect()
        };

        let results = match self.num_threads {
            Some(num_threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| Error::Internal(format!("failed to build thread pool: {e}")))?
                .install(run),
            None => run(),
        };

        #[cfg(feature = "progress_bar")]
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.finish();
        }

        let skipped = skipped.into_inner();
        if skipped > 0 {
            warn!(skipped, units = unit_count, "units skipped after a failure");
        }

        if let Some(e) = first_error
            .into_inner()
            .map_err(|_| Error::Internal("error slot poisoned".to_string()))?
        {
            return Err(e);
        }

        let mut values = Array3::zeros((self.steps.len(), key_size, GROUP_COUNT));
        let mut filled = 0;
        for (unit, scores) in results.into_iter().flatten() {
            values
                .slice_mut(s![unit / key_size, unit % key_size, ..])
                .assign(&scores);
            filled += 1;
        }
        if filled != unit_count {
            return Err(Error::Internal(format!(
                "{filled} of {unit_count} units computed"
            )));
        }

        info!(units = unit_count, "rank estimation completed");

        Ok(LogProbabilities {
            steps: self.steps.clone(),
            values,
        })
    }

    fn unit_done(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "progress_bar")]
        if let Some(progress_bar) = &self.progress_bar {
            progress_bar.inc(1);
        }
    }
}

/// Result of a [`RankEstimation`].
///
/// Holds one unnormalized log-probability per trace count checkpoint, key byte and hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct LogProbabilities {
    steps: Vec<usize>,
    /// Log-probabilities indexed by `[step][key byte][hypothesis]`
    values: Array3<f64>,
}

impl LogProbabilities {
    /// Return the trace count checkpoints, in ascending order.
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Return the number of key bytes.
    pub fn key_size(&self) -> usize {
        self.values.shape()[1]
    }

    /// Return the log-probabilities indexed by `[step][key byte][hypothesis]`.
    pub fn values(&self) -> ArrayView3<f64> {
        self.values.view()
    }

    /// Return the log-probabilities of the hypotheses of a key byte at a checkpoint.
    pub fn scores(&self, step_idx: usize, byte_index: usize) -> ArrayView1<f64> {
        self.values.slice(s![step_idx, byte_index, ..])
    }

    /// Return the most likely hypothesis of a key byte at a checkpoint.
    pub fn best_guess(&self, step_idx: usize, byte_index: usize) -> usize {
        argmax_by(self.scores(step_idx, byte_index), f64::total_cmp)
    }

    /// Return the hypotheses of a key byte at a checkpoint, from most to least likely.
    pub fn rank(&self, step_idx: usize, byte_index: usize) -> Array1<usize> {
        let scores = self.scores(step_idx, byte_index).to_vec();
        Array1::from_vec(argsort_by(&scores, |a, b| b.total_cmp(a)))
    }

    /// Return the position of `value` in [`LogProbabilities::rank`], `0` being the best guess.
    pub fn guess_rank(&self, step_idx: usize, byte_index: usize, value: u8) -> usize {
        self.rank(step_idx, byte_index)
            .iter()
            .position(|&guess| guess == value as usize)
            .unwrap_or(GROUP_COUNT)
    }

    /// Return the table header: the trace count column followed by one column per key byte and
    /// hypothesis.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(1 + self.key_size() * GROUP_COUNT);
        header.push("number_of_traces".to_string());
        for byte_index in 0..self.key_size() {
            for guess in 0..GROUP_COUNT {
                header.push(format!("byte_{byte_index}_guess_{guess}"));
            }
        }

        header
    }

    /// Write the table as CSV, one row per trace count checkpoint.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), Error> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(self.header())?;
        for (step, row) in self.steps.iter().zip(self.values.axis_iter(Axis(0))) {
            let mut record = Vec::with_capacity(1 + row.len());
            record.push(step.to_string());
            record.extend(row.iter().map(|x| x.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Save the table to a CSV file.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.write_csv(File::create(path)?)
    }
}
