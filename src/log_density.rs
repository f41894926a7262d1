use std::{error::Error, fmt::Debug};

use thiserror::Error;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// The user supplied log density and its gradient.
///
/// The function must be pure: chains evaluate it concurrently and rely on
/// it having no hidden state that influences the result.
pub trait LogDensity: Sync {
    type LogpError: Debug + LogpError;

    /// The number of parameters.
    fn dim(&self) -> usize;

    /// Compute the log density at `position` and write its gradient.
    ///
    /// Non-finite return values are not errors, the sampler treats them
    /// as divergences.
    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

impl<T: LogDensity + ?Sized> LogDensity for &T {
    type LogpError = T::LogpError;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        (**self).logp(position, gradient)
    }
}

#[derive(Error, Debug)]
pub enum FnLogDensityError {
    #[error("log density returned a gradient of length {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

impl LogpError for FnLogDensityError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Adapt a closure `ldg(position) -> (log_density, gradient)`.
pub struct FnLogDensity<F> {
    dim: usize,
    func: F,
}

impl<F> FnLogDensity<F>
where
    F: Fn(&[f64]) -> (f64, Vec<f64>) + Sync,
{
    pub fn new(dim: usize, func: F) -> Self {
        Self { dim, func }
    }
}

impl<F> LogDensity for FnLogDensity<F>
where
    F: Fn(&[f64]) -> (f64, Vec<f64>) + Sync,
{
    type LogpError = FnLogDensityError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        let (logp, grad) = (self.func)(position);
        if grad.len() != gradient.len() {
            return Err(FnLogDensityError::DimensionMismatch {
                expected: gradient.len(),
                found: grad.len(),
            });
        }
        gradient.copy_from_slice(&grad);
        Ok(logp)
    }
}
