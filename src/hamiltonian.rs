use std::sync::Arc;

use rand_distr::{Distribution, StandardUniform};

use crate::log_density::{LogDensity, LogpError};
use crate::mass_matrix::{MassMatrix, Metric};
use crate::math::all_finite;
use crate::nuts::{Collector, NutsError};
use crate::point::PSPoint;

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error or returned a
///   non-finite value.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

pub enum LeapfrogResult<E> {
    Ok(PSPoint),
    Divergence(DivergenceInfo),
    Err(E),
}

/// The hamiltonian with a euclidean metric: potential energy `-log p(q)`
/// and kinetic energy `pᵀ M⁻¹ p / 2`.
#[derive(Debug, Clone)]
pub struct EuclideanHamiltonian {
    pub(crate) metric: Metric,
    max_energy_error: f64,
    step_size: f64,
}

impl EuclideanHamiltonian {
    pub fn new(metric: Metric, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanHamiltonian {
            metric,
            max_energy_error,
            step_size,
        }
    }

    pub fn dim(&self) -> usize {
        self.metric.dim()
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn max_energy_error(&self) -> f64 {
        self.max_energy_error
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub(crate) fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    /// Perform one leapfrog step from `start` in direction `dir`.
    ///
    /// Return either an unrecoverable error, a new point or a divergence.
    /// The density is evaluated exactly once.
    pub fn leapfrog<D: LogDensity, C: Collector>(
        &self,
        density: &D,
        start: &PSPoint,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<D::LogpError> {
        let mut out = PSPoint::new(start.dim());
        out.initial_energy = start.initial_energy();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        start.first_momentum_halfstep(&mut out, epsilon);
        self.metric.update_velocity(&mut out);

        start.position_step(&mut out, epsilon);
        out.index_in_trajectory = start.index_in_trajectory() + sign;

        let logp = match density.logp(&out.position, &mut out.gradient) {
            Ok(logp) => logp,
            Err(logp_error) => {
                if !logp_error.is_recoverable() {
                    return LeapfrogResult::Err(logp_error);
                }
                let div_info = DivergenceInfo {
                    logp_function_error: Some(Arc::new(logp_error)),
                    start_location: Some(start.position().into()),
                    start_gradient: Some(start.gradient().into()),
                    start_momentum: Some(start.momentum().into()),
                    end_location: None,
                    start_idx_in_trajectory: Some(start.index_in_trajectory()),
                    end_idx_in_trajectory: None,
                    energy_error: None,
                };
                collector.register_leapfrog(start, &out, Some(&div_info));
                return LeapfrogResult::Divergence(div_info);
            }
        };
        out.potential_energy = -logp;

        out.second_momentum_halfstep(epsilon);

        self.metric.update_velocity(&mut out);
        self.metric.update_kinetic_energy(&mut out);

        start.set_psum(&mut out, dir);

        let energy_error = out.energy_error();
        if (energy_error.abs() > self.max_energy_error)
            | !energy_error.is_finite()
            | !all_finite(&out.gradient)
        {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.position().into()),
                start_gradient: Some(start.gradient().into()),
                end_location: Some(out.position().into()),
                start_momentum: Some(start.momentum().into()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    /// Initialize a point at a new location.
    ///
    /// The momentum is left at zero, it is set in
    /// [`EuclideanHamiltonian::initialize_trajectory`].
    pub fn init_state<D: LogDensity>(
        &self,
        density: &D,
        init: &[f64],
    ) -> Result<PSPoint, NutsError> {
        if init.len() != self.dim() {
            return Err(NutsError::DimensionMismatch {
                expected: self.dim(),
                found: init.len(),
            });
        }
        let mut point = PSPoint::new(self.dim());
        point.position.copy_from_slice(init);

        let logp = match density.logp(&point.position, &mut point.gradient) {
            Ok(logp) => logp,
            Err(err) if err.is_recoverable() => return Err(NutsError::BadInitGrad()),
            Err(err) => return Err(NutsError::LogpFailure(Box::new(err))),
        };
        point.potential_energy = -logp;

        if !logp.is_finite() | !all_finite(&point.gradient) {
            Err(NutsError::BadInitGrad())
        } else {
            Ok(point)
        }
    }

    /// Draw a new momentum for `point` and make it the start of a trajectory.
    pub fn initialize_trajectory<R: rand::Rng + ?Sized>(&self, point: &mut PSPoint, rng: &mut R) {
        self.metric.randomize_momentum(point, rng);
        self.metric.update_velocity(point);
        self.metric.update_kinetic_energy(point);
        point.make_init_point();
    }
}
