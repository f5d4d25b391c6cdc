//! Power models mapping key hypotheses to predicted leakages.
use ndarray::Array2;
use std::sync::Mutex;

use crate::{trace::TraceStore, Error};

pub mod aes;

pub fn hw(value: usize) -> usize {
    let mut tmp = 0;
    for i in 0..8 {
        if (value & (1 << i)) == (1 << i) {
            tmp += 1;
        }
    }
    tmp
}

/// Maps `(hypothesis, trace)` pairs to predicted leakage values.
///
/// The returned prediction matrix has one row per key hypothesis (256 rows) and one column per
/// trace of the store.
pub trait PowerModel: Sync {
    fn predictions(&self, store: &dyn TraceStore, byte_index: usize)
        -> Result<Array2<usize>, Error>;
}

/// A leakage function `f(plaintext_byte, guess)` applied to the targeted plaintext byte of each
/// trace.
impl<F> PowerModel for F
where
    F: Fn(usize, usize) -> usize + Sync,
{
    fn predictions(
        &self,
        store: &dyn TraceStore,
        byte_index: usize,
    ) -> Result<Array2<usize>, Error> {
        let plaintexts = store.plaintexts()?;
        if byte_index >= plaintexts.shape()[1] {
            return Err(Error::ModelError(format!(
                "plaintexts have no byte {byte_index}"
            )));
        }

        let column = plaintexts.column(byte_index);
        Ok(Array2::from_shape_fn((256, column.len()), |(guess, trace)| {
            (self)(column[trace] as usize, guess)
        }))
    }
}

/// A power model whose targeted key byte is internal state.
///
/// Selecting a byte and materializing its predictions must happen without any other selection in
/// between, see [`Locked`].
pub trait StatefulPowerModel: Send {
    fn select_byte_index(&mut self, index: usize);

    /// Compute the prediction matrix of the currently selected byte.
    fn materialize(&self, store: &dyn TraceStore) -> Result<Array2<usize>, Error>;
}

/// Shares a [`StatefulPowerModel`] between threads.
///
/// Each call to [`PowerModel::predictions`] holds the lock for the whole select + materialize
/// sequence, so concurrent callers always receive the predictions of the byte they asked for.
pub struct Locked<M> {
    inner: Mutex<M>,
}

impl<M> Locked<M> {
    pub fn new(model: M) -> Self {
        Self {
            inner: Mutex::new(model),
        }
    }

    pub fn into_inner(self) -> Result<M, Error> {
        self.inner
            .into_inner()
            .map_err(|_| Error::Internal("power model lock poisoned".to_string()))
    }
}

impl<M: StatefulPowerModel> PowerModel for Locked<M> {
    fn predictions(
        &self,
        store: &dyn TraceStore,
        byte_index: usize,
    ) -> Result<Array2<usize>, Error> {
        let mut model = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("power model lock poisoned".to_string()))?;

        model.select_byte_index(byte_index);
        model.materialize(store)
    }
}
