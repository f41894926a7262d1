use faer::Mat;
use itertools::izip;
use rand_distr::StandardNormal;

use crate::math::{matvec, multiply, vector_dot};
use crate::nuts::NutsError;
use crate::point::PSPoint;

/// Eigenvalues and variances of the inverse mass matrix are kept inside this range.
pub const METRIC_CLAMP: (f64, f64) = (1e-20, 1e20);

/// Relative tolerance for the symmetry of a user supplied covariance.
const SYMMETRY_TOLERANCE: f64 = 1e-10;

/// Weight of the regularization target `1e-3 · I`, see [`regularize`].
const REGULARIZATION_COUNT: f64 = 5.;
const REGULARIZATION_SCALE: f64 = 1e-3;

/// Shrink a sample (co)variance estimate towards `1e-3 · I`.
///
/// Returns `(scale, shift)` so that the regularized estimate is
/// `scale · Σ + shift · I`.
pub(crate) fn regularize(count: u64) -> (f64, f64) {
    let n = count as f64;
    let scale = n / (n + REGULARIZATION_COUNT);
    let shift = REGULARIZATION_SCALE * REGULARIZATION_COUNT / (n + REGULARIZATION_COUNT);
    (scale, shift)
}

pub trait MassMatrix {
    fn update_velocity(&self, point: &mut PSPoint);
    fn update_kinetic_energy(&self, point: &mut PSPoint);
    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut PSPoint, rng: &mut R);
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// The identity metric.
    pub fn new(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    /// A metric with the given inverse mass matrix diagonal.
    pub fn from_variance(variance: &[f64]) -> Result<Self, NutsError> {
        if variance.iter().any(|&val| !val.is_finite() || val <= 0.) {
            return Err(NutsError::InvalidSettings(
                "inverse mass matrix diagonal must be positive and finite".to_string(),
            ));
        }
        let mut matrix = Self::new(variance.len());
        matrix.update_diag(variance, 1., 0.);
        Ok(matrix)
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    /// Set the diagonal to `scale · draw_var + shift`.
    ///
    /// Entries that are not finite or zero keep their previous value.
    pub(crate) fn update_diag(&mut self, draw_var: &[f64], scale: f64, shift: f64) {
        assert!(draw_var.len() == self.variance.len());
        izip!(
            self.variance.iter_mut(),
            self.inv_stds.iter_mut(),
            draw_var.iter()
        )
        .for_each(|(var_out, inv_std_out, &draw_var)| {
            let draw_var = draw_var.mul_add(scale, shift);
            if (!draw_var.is_finite()) | (draw_var == 0f64) {
                return;
            }
            let val = draw_var.clamp(METRIC_CLAMP.0, METRIC_CLAMP.1);
            *var_out = val;
            *inv_std_out = val.recip().sqrt();
        });
    }

    /// Install the regularized variance estimate from `count` draws.
    pub(crate) fn update_from_variance(&mut self, variance: &[f64], count: u64) {
        let (scale, shift) = regularize(count);
        self.update_diag(variance, scale, shift);
    }
}

impl MassMatrix for DiagMassMatrix {
    fn update_velocity(&self, point: &mut PSPoint) {
        multiply(&self.variance, &point.momentum, &mut point.velocity);
    }

    fn update_kinetic_energy(&self, point: &mut PSPoint) {
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut PSPoint, rng: &mut R) {
        izip!(point.momentum.iter_mut(), self.inv_stds.iter()).for_each(|(p, &s)| {
            let norm: f64 = rng.sample(StandardNormal);
            *p = s * norm;
        });
    }
}

/// A dense metric.
///
/// `covariance` is the inverse mass matrix in row-major order,
/// `momentum_factor` is `U Λ^{-1/2}` where `U Λ Uᵀ` is the eigendecomposition
/// of the covariance, so that `momentum_factor · z` with `z ~ N(0, I)` has
/// covariance `M`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMassMatrix {
    dim: usize,
    covariance: Box<[f64]>,
    momentum_factor: Box<[f64]>,
}

impl DenseMassMatrix {
    pub fn new(dim: usize) -> Self {
        let identity: Box<[f64]> = (0..dim * dim)
            .map(|i| if i / dim == i % dim { 1. } else { 0. })
            .collect();
        Self {
            dim,
            covariance: identity.clone(),
            momentum_factor: identity,
        }
    }

    /// A metric with the given inverse mass matrix (row-major).
    pub fn from_covariance(dim: usize, covariance: &[f64]) -> Result<Self, NutsError> {
        if covariance.len() != dim * dim {
            return Err(NutsError::DimensionMismatch {
                expected: dim * dim,
                found: covariance.len(),
            });
        }
        let cov = Mat::from_fn(dim, dim, |i, j| covariance[i * dim + j]);
        let symmetric = (0..dim).all(|i| {
            (0..i).all(|j| {
                let (a, b) = (cov[(i, j)], cov[(j, i)]);
                (a - b).abs() <= SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.)
            })
        });
        let mut matrix = Self::new(dim);
        if !symmetric || !matrix.update_covariance(cov, 1., 0.) {
            return Err(NutsError::InvalidSettings(
                "inverse mass matrix must be symmetric positive definite".to_string(),
            ));
        }
        Ok(matrix)
    }

    /// The inverse mass matrix in row-major order.
    pub fn covariance(&self) -> &[f64] {
        &self.covariance
    }

    /// Install the regularized covariance estimate from `count` draws.
    ///
    /// Returns false and keeps the previous metric if the estimate is not
    /// positive definite.
    pub(crate) fn update_from_covariance(&mut self, covariance: Mat<f64>, count: u64) -> bool {
        let (scale, shift) = regularize(count);
        self.update_covariance(covariance, scale, shift)
    }

    fn update_covariance(&mut self, cov: Mat<f64>, scale: f64, shift: f64) -> bool {
        let dim = self.dim;
        assert!(cov.nrows() == dim && cov.ncols() == dim);

        // Symmetrize, the eigensolver only reads the lower triangle.
        let cov = Mat::from_fn(dim, dim, |i, j| {
            let val = 0.5 * (cov[(i, j)] + cov[(j, i)]) * scale;
            if i == j {
                val + shift
            } else {
                val
            }
        });

        let mut ok = true;
        faer::zip!(cov.as_ref()).for_each(|faer::unzip!(val)| ok &= val.is_finite());
        if !ok {
            return false;
        }

        let Ok(eig) = cov.self_adjoint_eigen(faer::Side::Lower) else {
            return false;
        };
        let u = eig.U();
        let vals = eig.S().column_vector().to_owned();
        if vals.iter().any(|val| !(val.is_finite() && *val > 0.)) {
            return false;
        }
        let clamped: Vec<f64> = vals
            .iter()
            .map(|val| val.clamp(METRIC_CLAMP.0, METRIC_CLAMP.1))
            .collect();

        let mut covariance = vec![0f64; dim * dim];
        let mut factor = vec![0f64; dim * dim];
        for i in 0..dim {
            for j in 0..dim {
                factor[i * dim + j] = u[(i, j)] / clamped[j].sqrt();
                covariance[i * dim + j] = (0..dim)
                    .map(|k| u[(i, k)] * clamped[k] * u[(j, k)])
                    .sum();
            }
        }
        for i in 0..dim {
            let diag = &mut covariance[i * dim + i];
            *diag = diag.clamp(METRIC_CLAMP.0, METRIC_CLAMP.1);
        }

        self.covariance = covariance.into();
        self.momentum_factor = factor.into();
        true
    }
}

impl MassMatrix for DenseMassMatrix {
    fn update_velocity(&self, point: &mut PSPoint) {
        matvec(&self.covariance, &point.momentum, &mut point.velocity);
    }

    fn update_kinetic_energy(&self, point: &mut PSPoint) {
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut PSPoint, rng: &mut R) {
        let z: Vec<f64> = (0..self.dim).map(|_| rng.sample(StandardNormal)).collect();
        matvec(&self.momentum_factor, &z, &mut point.momentum);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    #[default]
    Diagonal,
    Dense,
}

/// The euclidean metric of a chain, either diagonal or dense.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    Diagonal(DiagMassMatrix),
    Dense(DenseMassMatrix),
}

impl Metric {
    /// The identity metric of the given kind.
    pub fn new(kind: MetricKind, dim: usize) -> Self {
        match kind {
            MetricKind::Diagonal => Metric::Diagonal(DiagMassMatrix::new(dim)),
            MetricKind::Dense => Metric::Dense(DenseMassMatrix::new(dim)),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Diagonal(_) => MetricKind::Diagonal,
            Metric::Dense(_) => MetricKind::Dense,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Metric::Diagonal(inner) => inner.variance.len(),
            Metric::Dense(inner) => inner.dim,
        }
    }

    /// The diagonal of the inverse mass matrix.
    pub fn inverse_mass_diagonal(&self) -> Vec<f64> {
        match self {
            Metric::Diagonal(inner) => inner.variance.to_vec(),
            Metric::Dense(inner) => (0..inner.dim)
                .map(|i| inner.covariance[i * inner.dim + i])
                .collect(),
        }
    }
}

impl MassMatrix for Metric {
    fn update_velocity(&self, point: &mut PSPoint) {
        match self {
            Metric::Diagonal(inner) => inner.update_velocity(point),
            Metric::Dense(inner) => inner.update_velocity(point),
        }
    }

    fn update_kinetic_energy(&self, point: &mut PSPoint) {
        match self {
            Metric::Diagonal(inner) => inner.update_kinetic_energy(point),
            Metric::Dense(inner) => inner.update_kinetic_energy(point),
        }
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut PSPoint, rng: &mut R) {
        match self {
            Metric::Diagonal(inner) => inner.randomize_momentum(point, rng),
            Metric::Dense(inner) => inner.randomize_momentum(point, rng),
        }
    }
}
