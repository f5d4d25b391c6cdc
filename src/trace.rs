//! Read-only access to side channel trace datasets.
use ndarray::{Array2, ArrayView1, ArrayView2};
use ndarray_npy::read_npy;
use num_traits::AsPrimitive;
use std::path::Path;

use crate::Error;

/// How the key varies across the traces of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// The same key is used for every trace.
    Fixed,
    /// Each trace has its own key.
    Random,
}

/// Dataset dimensions and key properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Number of traces
    pub trace_count: usize,
    /// Number of samples per trace
    pub sample_count: usize,
    /// Number of key bytes
    pub key_size: usize,
    pub key_mode: KeyMode,
}

/// A read-only trace dataset.
///
/// Implementations are shared by reference across worker threads.
pub trait TraceStore: Sync {
    fn header(&self) -> Header;

    /// Return the key used for all traces.
    ///
    /// Only valid for [`KeyMode::Fixed`] datasets.
    fn key(&self) -> Result<&[u8], Error>;

    /// Return the `index`-th sample of every trace (one value per trace).
    fn sample(&self, index: usize) -> Result<ArrayView1<'_, f64>, Error>;

    /// Return the plaintexts, one row per trace.
    fn plaintexts(&self) -> Result<ArrayView2<'_, u8>, Error>;
}

/// An in-memory [`TraceStore`].
#[derive(Debug, Clone)]
pub struct TraceDataset {
    /// Leakage waveforms, one row per trace
    traces: Array2<f64>,
    /// Plaintexts, one row per trace
    plaintexts: Array2<u8>,
    key: Vec<u8>,
    key_mode: KeyMode,
}

impl TraceDataset {
    /// Create a fixed key dataset.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if traces and plaintexts do not have the same number of
    /// rows, or if the key is empty.
    pub fn new<T>(traces: Array2<T>, plaintexts: Array2<u8>, key: Vec<u8>) -> Result<Self, Error>
    where
        T: AsPrimitive<f64>,
    {
        Self::with_key_mode(traces, plaintexts, key, KeyMode::Fixed)
    }

    pub fn with_key_mode<T>(
        traces: Array2<T>,
        plaintexts: Array2<u8>,
        key: Vec<u8>,
        key_mode: KeyMode,
    ) -> Result<Self, Error>
    where
        T: AsPrimitive<f64>,
    {
        if traces.shape()[0] != plaintexts.shape()[0] {
            return Err(Error::InvalidArgument(format!(
                "{} traces but {} plaintexts",
                traces.shape()[0],
                plaintexts.shape()[0]
            )));
        }
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".to_string()));
        }

        Ok(Self {
            traces: traces.mapv(|x| x.as_()),
            plaintexts,
            key,
            key_mode,
        })
    }

    /// Load a fixed key dataset from a `f64` traces npy file and a `u8` plaintexts npy file.
    pub fn from_npy<P: AsRef<Path>>(
        traces_path: P,
        plaintexts_path: P,
        key: Vec<u8>,
    ) -> Result<Self, Error> {
        let traces: Array2<f64> = read_npy(traces_path)?;
        let plaintexts: Array2<u8> = read_npy(plaintexts_path)?;

        Self::new(traces, plaintexts, key)
    }

    /// Return the leakage waveforms, one row per trace.
    pub fn traces(&self) -> ArrayView2<'_, f64> {
        self.traces.view()
    }
}

impl TraceStore for TraceDataset {
    fn header(&self) -> Header {
        Header {
            trace_count: self.traces.shape()[0],
            sample_count: self.traces.shape()[1],
            key_size: self.key.len(),
            key_mode: self.key_mode,
        }
    }

    fn key(&self) -> Result<&[u8], Error> {
        match self.key_mode {
            KeyMode::Fixed => Ok(&self.key),
            KeyMode::Random => Err(Error::UnsupportedOperation(
                "the dataset key is not fixed across traces".to_string(),
            )),
        }
    }

    fn sample(&self, index: usize) -> Result<ArrayView1<'_, f64>, Error> {
        if index >= self.traces.shape()[1] {
            return Err(Error::InvalidArgument(format!(
                "sample {index} out of range (dataset has {} samples)",
                self.traces.shape()[1]
            )));
        }

        Ok(self.traces.column(index))
    }

    fn plaintexts(&self) -> Result<ArrayView2<'_, u8>, Error> {
        Ok(self.plaintexts.view())
    }
}
