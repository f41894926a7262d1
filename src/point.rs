use crate::hamiltonian::Direction;
use crate::math::{axpy, axpy_out, diff_prods, scalar_prods2, scalar_prods3};

/// Which termination criterion the trajectory builder uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnCriterion {
    /// The generalized no-U-turn criterion based on the sum of the momenta
    /// along the trajectory and the velocities at its ends.
    #[default]
    MomentumSum,
    /// `(q⁺ − q⁻)·v⁻ < 0` or `(q⁺ − q⁻)·v⁺ < 0`.
    PositionDifference,
}

/// A point in phase space.
///
/// Apart from position and momentum this caches the quantities the
/// integrator and the trajectory builder need: the gradient of the log
/// density, the velocity `M⁻¹p`, the kinetic energy, the sum of the momenta
/// from the start of the trajectory and the index of the point in the
/// trajectory.
#[derive(Debug, Clone)]
pub struct PSPoint {
    pub(crate) position: Box<[f64]>,
    pub(crate) momentum: Box<[f64]>,
    pub(crate) gradient: Box<[f64]>,
    pub(crate) velocity: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) potential_energy: f64,
    pub(crate) kinetic_energy: f64,
    pub(crate) index_in_trajectory: i64,
    pub(crate) initial_energy: f64,
}

impl PSPoint {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            position: vec![0f64; dim].into(),
            momentum: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
            velocity: vec![0f64; dim].into(),
            p_sum: vec![0f64; dim].into(),
            potential_energy: 0f64,
            kinetic_energy: 0f64,
            index_in_trajectory: 0,
            initial_energy: 0f64,
        }
    }

    pub fn dim(&self) -> usize {
        self.position.len()
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn momentum(&self) -> &[f64] {
        &self.momentum
    }

    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    pub fn velocity(&self) -> &[f64] {
        &self.velocity
    }

    pub fn log_density(&self) -> f64 {
        -self.potential_energy
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.kinetic_energy
    }

    /// The total energy (potential + kinetic)
    pub fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    /// The energy of the first point of the trajectory this point belongs to.
    pub fn initial_energy(&self) -> f64 {
        self.initial_energy
    }

    pub fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy
    }

    /// Position relative to the start of the trajectory, negative for
    /// points reached by integrating backward in time.
    pub fn index_in_trajectory(&self) -> i64 {
        self.index_in_trajectory
    }

    /// Multinomial log weight of this point, `H₀ − H`.
    pub(crate) fn log_weight(&self) -> f64 {
        self.initial_energy - self.energy()
    }

    /// Turn this point into the first point of a new trajectory.
    ///
    /// Expects momentum, velocity and kinetic energy to be up to date.
    pub(crate) fn make_init_point(&mut self) {
        self.index_in_trajectory = 0;
        self.initial_energy = self.energy();
        self.p_sum.copy_from_slice(&self.momentum);
    }

    pub(crate) fn is_turning(&self, other: &Self, criterion: TurnCriterion) -> bool {
        let (start, end) = if self.index_in_trajectory < other.index_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.index_in_trajectory;
        let b = end.index_in_trajectory;

        assert!(a < b);

        let (turn1, turn2) = match criterion {
            TurnCriterion::PositionDifference => diff_prods(
                &end.position,
                &start.position,
                &end.velocity,
                &start.velocity,
            ),
            TurnCriterion::MomentumSum => {
                if (a >= 0) & (b >= 0) {
                    scalar_prods3(
                        &end.p_sum,
                        &start.p_sum,
                        &start.momentum,
                        &end.velocity,
                        &start.velocity,
                    )
                } else if (b >= 0) & (a < 0) {
                    scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
                } else {
                    assert!((a < 0) & (b < 0));
                    scalar_prods3(
                        &start.p_sum,
                        &end.p_sum,
                        &end.momentum,
                        &end.velocity,
                        &start.velocity,
                    )
                }
            }
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&self.gradient, &self.momentum, epsilon / 2., &mut out.momentum);
    }

    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&out.velocity, &self.position, epsilon, &mut out.position);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.gradient, &mut self.momentum, epsilon / 2.);
    }

    /// Update the momentum sum of `out`, a neighbour of `self` in direction `_dir`.
    ///
    /// Points at negative indices sum towards more negative indices, so the
    /// first backward point starts a new sum.
    pub(crate) fn set_psum(&self, out: &mut Self, _dir: Direction) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }
}
