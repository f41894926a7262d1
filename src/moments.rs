//! Running estimates of the mean and (co)variance of the draws of one or
//! more chains, used to adapt the metric during warmup.
//!
//! Both estimators keep one column per chain. An update with a `d × n`
//! matrix either updates column `j` with column `j` of the input (`n`
//! equals the number of columns) or, if there is only a single column,
//! adds all `n` input columns to it. The latter pools the draws of all
//! chains into one estimate.

use faer::{Mat, MatRef};

use crate::nuts::NutsError;

fn check_shape(dim: usize, columns: usize, x: MatRef<'_, f64>) -> Result<bool, NutsError> {
    if x.nrows() != dim {
        return Err(NutsError::DimensionMismatch {
            expected: dim,
            found: x.nrows(),
        });
    }
    if x.ncols() == columns {
        Ok(false)
    } else if columns == 1 {
        Ok(true)
    } else {
        Err(NutsError::DimensionMismatch {
            expected: columns,
            found: x.ncols(),
        })
    }
}

/// Welford estimate of mean and variance, `d × c`.
#[derive(Debug, Clone)]
pub struct OnlineMoments {
    mean: Mat<f64>,
    m2: Mat<f64>,
    count: Vec<u64>,
    update_enabled: bool,
}

impl OnlineMoments {
    pub fn new(dim: usize, columns: usize) -> Self {
        Self {
            mean: Mat::zeros(dim, columns),
            m2: Mat::zeros(dim, columns),
            count: vec![0; columns],
            update_enabled: true,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.nrows()
    }

    pub fn columns(&self) -> usize {
        self.mean.ncols()
    }

    pub fn update_enabled(&self) -> bool {
        self.update_enabled
    }

    pub fn set_update_enabled(&mut self, enabled: bool) {
        self.update_enabled = enabled;
    }

    /// Add the columns of `x` (`d × n`).
    pub fn update(&mut self, x: MatRef<'_, f64>) -> Result<(), NutsError> {
        let pooled = check_shape(self.dim(), self.columns(), x)?;
        if !self.update_enabled {
            return Ok(());
        }
        for j in 0..x.ncols() {
            let col = if pooled { 0 } else { j };
            self.add_sample(col, x, j);
        }
        Ok(())
    }

    fn add_sample(&mut self, col: usize, x: MatRef<'_, f64>, j: usize) {
        self.count[col] += 1;
        let n = self.count[col] as f64;
        for i in 0..self.dim() {
            let value = x[(i, j)];
            let delta = value - self.mean[(i, col)];
            self.mean[(i, col)] += delta / n;
            let delta2 = value - self.mean[(i, col)];
            self.m2[(i, col)] += delta * delta2;
        }
    }

    pub fn mean(&self) -> MatRef<'_, f64> {
        self.mean.as_ref()
    }

    /// The unbiased sample variance `M2 / (n - 1)`, zero with fewer than two samples.
    pub fn variance(&self) -> Mat<f64> {
        Mat::from_fn(self.dim(), self.columns(), |i, j| {
            let denom = (self.count[j].max(2) - 1) as f64;
            self.m2[(i, j)] / denom
        })
    }

    pub fn count(&self) -> &[u64] {
        &self.count
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        self.mean = Mat::zeros(self.dim(), self.columns());
        self.m2 = Mat::zeros(self.dim(), self.columns());
        self.count.fill(0);
    }
}

/// Welford estimate of mean and covariance, with one `d × d` matrix per column.
#[derive(Debug, Clone)]
pub struct OnlineCovariance {
    mean: Mat<f64>,
    m2: Vec<Mat<f64>>,
    count: Vec<u64>,
    update_enabled: bool,
}

impl OnlineCovariance {
    pub fn new(dim: usize, columns: usize) -> Self {
        Self {
            mean: Mat::zeros(dim, columns),
            m2: (0..columns).map(|_| Mat::zeros(dim, dim)).collect(),
            count: vec![0; columns],
            update_enabled: true,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.nrows()
    }

    pub fn columns(&self) -> usize {
        self.mean.ncols()
    }

    pub fn set_update_enabled(&mut self, enabled: bool) {
        self.update_enabled = enabled;
    }

    pub fn update(&mut self, x: MatRef<'_, f64>) -> Result<(), NutsError> {
        let pooled = check_shape(self.dim(), self.columns(), x)?;
        if !self.update_enabled {
            return Ok(());
        }
        let dim = self.dim();
        let mut delta = vec![0f64; dim];
        let mut delta2 = vec![0f64; dim];
        for j in 0..x.ncols() {
            let col = if pooled { 0 } else { j };
            self.count[col] += 1;
            let n = self.count[col] as f64;
            for i in 0..dim {
                delta[i] = x[(i, j)] - self.mean[(i, col)];
                self.mean[(i, col)] += delta[i] / n;
                delta2[i] = x[(i, j)] - self.mean[(i, col)];
            }
            let m2 = &mut self.m2[col];
            for i in 0..dim {
                for k in 0..dim {
                    m2[(i, k)] += delta[i] * delta2[k];
                }
            }
        }
        Ok(())
    }

    pub fn mean(&self) -> MatRef<'_, f64> {
        self.mean.as_ref()
    }

    /// The unbiased sample covariance of column `col`.
    pub fn covariance(&self, col: usize) -> Mat<f64> {
        let denom = (self.count[col].max(2) - 1) as f64;
        let m2 = &self.m2[col];
        Mat::from_fn(self.dim(), self.dim(), |i, k| m2[(i, k)] / denom)
    }

    pub fn count(&self) -> &[u64] {
        &self.count
    }

    pub fn reset(&mut self) {
        let dim = self.dim();
        self.mean = Mat::zeros(dim, self.columns());
        self.m2.iter_mut().for_each(|m2| *m2 = Mat::zeros(dim, dim));
        self.count.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn batch_mean_var(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.);
        (mean, var)
    }

    proptest! {
        #[test]
        fn matches_batch_and_is_order_invariant(
            values in prop::collection::vec(-100f64..100f64, 2..60),
        ) {
            let mut forward = OnlineMoments::new(1, 1);
            let mut backward = OnlineMoments::new(1, 1);
            for &val in values.iter() {
                forward.update(Mat::from_fn(1, 1, |_, _| val).as_ref()).unwrap();
            }
            for &val in values.iter().rev() {
                backward.update(Mat::from_fn(1, 1, |_, _| val).as_ref()).unwrap();
            }
            let (mean, var) = batch_mean_var(&values);
            let tol = 1e-8 * (1. + var.abs());
            prop_assert!((forward.mean()[(0, 0)] - mean).abs() < 1e-8);
            prop_assert!((forward.variance()[(0, 0)] - var).abs() < tol);
            prop_assert!((backward.mean()[(0, 0)] - mean).abs() < 1e-8);
            prop_assert!((backward.variance()[(0, 0)] - var).abs() < tol);
            prop_assert_eq!(forward.count(), &[values.len() as u64]);
        }
    }

    #[test]
    fn per_column_and_pooled() {
        let x = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f64);
        let y = Mat::from_fn(2, 3, |i, j| (i * 3 + j) as f64 * 2.);

        let mut moments = OnlineMoments::new(2, 3);
        moments.update(x.as_ref()).unwrap();
        moments.update(y.as_ref()).unwrap();
        assert_eq!(moments.count(), &[2, 2, 2]);
        for j in 0..3 {
            let (mean, var) = batch_mean_var(&[x[(1, j)], y[(1, j)]]);
            assert_abs_diff_eq!(moments.mean()[(1, j)], mean);
            assert_abs_diff_eq!(moments.variance()[(1, j)], var);
        }

        let mut pooled = OnlineMoments::new(2, 1);
        pooled.update(x.as_ref()).unwrap();
        pooled.update(y.as_ref()).unwrap();
        assert_eq!(pooled.count(), &[6]);
        let values: Vec<f64> = (0..3).flat_map(|j| [x[(0, j)], y[(0, j)]]).collect();
        let (mean, var) = batch_mean_var(&values);
        assert_abs_diff_eq!(pooled.mean()[(0, 0)], mean, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.variance()[(0, 0)], var, epsilon = 1e-12);
    }

    #[test]
    fn shape_mismatch() {
        let mut moments = OnlineMoments::new(2, 3);
        let x = Mat::<f64>::zeros(2, 2);
        assert!(matches!(
            moments.update(x.as_ref()),
            Err(NutsError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
        let x = Mat::<f64>::zeros(3, 3);
        assert!(moments.update(x.as_ref()).is_err());
    }

    #[test]
    fn disabled_and_reset() {
        let mut moments = OnlineMoments::new(1, 1);
        moments.update(Mat::from_fn(1, 2, |_, j| j as f64).as_ref()).unwrap();
        moments.set_update_enabled(false);
        moments.update(Mat::from_fn(1, 2, |_, _| 10.).as_ref()).unwrap();
        assert_eq!(moments.count(), &[2]);
        assert_abs_diff_eq!(moments.variance()[(0, 0)], 0.5);
        moments.reset();
        assert_eq!(moments.count(), &[0]);
        assert_eq!(moments.variance()[(0, 0)], 0.);
    }

    #[test]
    fn covariance_matches_batch() {
        let draws = [[1., 2.], [2., 1.], [3., 5.], [-1., 0.5]];
        let mut cov = OnlineCovariance::new(2, 1);
        for draw in draws {
            cov.update(Mat::from_fn(2, 1, |i, _| draw[i]).as_ref()).unwrap();
        }
        let n = draws.len() as f64;
        let mean = [
            draws.iter().map(|d| d[0]).sum::<f64>() / n,
            draws.iter().map(|d| d[1]).sum::<f64>() / n,
        ];
        let c = cov.covariance(0);
        for i in 0..2 {
            for k in 0..2 {
                let expected = draws
                    .iter()
                    .map(|d| (d[i] - mean[i]) * (d[k] - mean[k]))
                    .sum::<f64>()
                    / (n - 1.);
                assert_abs_diff_eq!(c[(i, k)], expected, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(cov.mean()[(1, 0)], mean[1]);
    }
}
