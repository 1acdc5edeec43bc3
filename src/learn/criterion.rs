use crate::{error::Error, result::Result};
use ndarray::{ArrayBase, Data, Dimension};

/// Criterion.
///
/// Computes a metric or loss from an `input` and a `target`.
pub trait Criterion<X, T> {
    /// The output.
    type Output;
    /// Evaluates the criterion.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Binary cross entropy loss.
///
/// The mean over all elements of -(t * ln(x) + (1 - t) * ln(1 - x)), where `x` is a
/// probability. The logarithms are clamped to be at least -100 so that the loss is finite for
/// saturated predictions.
#[derive(Default, Clone, Copy, Debug)]
pub struct BCELoss;

/// Clamp of the log terms.
pub(crate) const LOG_MIN: f32 = -100.;

/// ln(x) clamped to [`LOG_MIN`]. NaN is kept.
fn clamped_ln(x: f32) -> f32 {
    let log = x.ln();
    if log.is_nan() {
        log
    } else {
        log.max(LOG_MIN)
    }
}

impl<S1, S2, D> Criterion<ArrayBase<S1, D>, ArrayBase<S2, D>> for BCELoss
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    type Output = f32;
    fn eval(&self, input: ArrayBase<S1, D>, target: ArrayBase<S2, D>) -> Result<f32> {
        if input.shape() != target.shape() {
            return Err(Error::shape_mismatch("BCELoss", input.shape(), target.shape()).into());
        }
        let n = input.len().max(1) as f32;
        let sum: f32 = input
            .iter()
            .zip(target.iter())
            .map(|(x, t)| {
                let log_x = clamped_ln(*x);
                let log_1m_x = clamped_ln(1. - x);
                -(t * log_x + (1. - t) * log_1m_x)
            })
            .sum();
        Ok(sum / n)
    }
}
