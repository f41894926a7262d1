use log::{info, warn};
use rand::Rng;

use crate::adapt_strategy::find_reasonable_step_size;
use crate::hamiltonian::{DivergenceInfo, EuclideanHamiltonian};
use crate::log_density::LogDensity;
use crate::mass_matrix::Metric;
use crate::nuts::{draw, NutsError, NutsOptions};
use crate::point::PSPoint;
use crate::stepsize::{AcceptanceRateCollector, StepsizeAdaptation, StepsizeAdapter};

/// Whether a chain is still adapting.
///
/// A chain only ever moves from `Warmup` to `Sampling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Sampling,
}

/// Diagnostic information about a single draw.
#[derive(Debug, Clone)]
pub struct DrawStats {
    pub chain: u64,
    pub draw: u64,
    pub tuning: bool,
    /// The step size used for this draw.
    pub step_size: f64,
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub diverging: bool,
    /// Mean of `min(1, exp(H₀ − H))` over the leapfrog steps of the trajectory.
    pub accept_stat: f64,
    /// Number of leapfrog steps (and density evaluations) of the trajectory.
    pub n_steps: u64,
    pub energy: f64,
    pub energy_error: f64,
    pub log_density: f64,
    pub index_in_trajectory: i64,
    pub divergence_info: Option<DivergenceInfo>,
}

/// A single Markov chain with its own hamiltonian, step size adapter and
/// random number stream.
pub struct NutsChain<R: Rng> {
    hamiltonian: EuclideanHamiltonian,
    stepsize: StepsizeAdapter,
    stepsize_adaptation: StepsizeAdaptation,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: Option<PSPoint>,
    chain: u64,
    draw_count: u64,
    phase: Phase,
}

impl<R: Rng> NutsChain<R> {
    pub fn new(
        hamiltonian: EuclideanHamiltonian,
        stepsize_adaptation: StepsizeAdaptation,
        options: NutsOptions,
        rng: R,
        chain: u64,
    ) -> Self {
        let stepsize = StepsizeAdapter::new(stepsize_adaptation, hamiltonian.step_size());
        NutsChain {
            hamiltonian,
            stepsize,
            stepsize_adaptation,
            collector: AcceptanceRateCollector::new(),
            options,
            rng,
            state: None,
            chain,
            draw_count: 0,
            phase: Phase::Warmup,
        }
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    pub fn metric(&self) -> &Metric {
        self.hamiltonian.metric()
    }

    pub(crate) fn metric_mut(&mut self) -> &mut Metric {
        &mut self.hamiltonian.metric
    }

    /// The current point of the chain, if it was initialized.
    pub fn current_point(&self) -> Option<&PSPoint> {
        self.state.as_ref()
    }

    /// Initialize the chain at `position`.
    ///
    /// This fails if the logp function returns an error or a non-finite value.
    pub fn set_position<D: LogDensity>(
        &mut self,
        density: &D,
        position: &[f64],
    ) -> Result<(), NutsError> {
        self.state = Some(self.hamiltonian.init_state(density, position)?);
        Ok(())
    }

    /// Initialize the chain at a point drawn uniformly from `(-radius, radius)^d`,
    /// retrying up to `attempts` times if the density is not finite there.
    pub fn init_random<D: LogDensity>(
        &mut self,
        density: &D,
        radius: f64,
        attempts: u64,
    ) -> Result<(), NutsError> {
        let dim = self.dim();
        for attempt in 0..attempts {
            let init: Vec<f64> = (0..dim)
                .map(|_| self.rng.random_range(-radius..radius))
                .collect();
            match self.hamiltonian.init_state(density, &init) {
                Ok(point) => {
                    self.state = Some(point);
                    return Ok(());
                }
                Err(NutsError::BadInitGrad()) => {
                    warn!(
                        "Chain {}: rejected initial point {} of {attempts}, density not finite",
                        self.chain,
                        attempt + 1,
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(NutsError::BadInitGrad())
    }

    /// Pick a step size with the step size heuristic and restart the adapter there.
    pub fn init_step_size<D: LogDensity>(
        &mut self,
        density: &D,
        target_accept: f64,
    ) -> Result<f64, NutsError> {
        let Some(point) = self.state.as_ref() else {
            return Err(uninitialized());
        };
        let step_size = find_reasonable_step_size(
            density,
            &mut self.hamiltonian,
            point,
            target_accept,
            &mut self.rng,
        )?;
        if self.draw_count == 0 {
            self.stepsize = StepsizeAdapter::new(self.stepsize_adaptation, step_size);
        } else {
            self.stepsize.restart(step_size);
        }
        *self.hamiltonian.step_size_mut() = self.stepsize.current_step_size();
        Ok(step_size)
    }

    /// Run one NUTS transition.
    ///
    /// During warmup the acceptance statistic of the transition adapts the
    /// step size.
    pub fn draw<D: LogDensity>(
        &mut self,
        density: &D,
        target_accept: f64,
    ) -> Result<(PSPoint, DrawStats), NutsError> {
        let Some(init) = self.state.as_mut() else {
            return Err(uninitialized());
        };
        let step_size = self.hamiltonian.step_size();
        let (point, info) = draw(
            density,
            init,
            &mut self.rng,
            &self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;

        let tuning = self.phase == Phase::Warmup;
        let accept_stat = self.collector.accept_stat();
        if tuning {
            self.stepsize.adapt_stepsize(accept_stat, target_accept);
            *self.hamiltonian.step_size_mut() = self.stepsize.current_step_size();
        }

        let stats = DrawStats {
            chain: self.chain,
            draw: self.draw_count,
            tuning,
            step_size,
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            diverging: info.divergence_info.is_some(),
            accept_stat,
            n_steps: self.collector.n_steps(),
            energy: point.energy(),
            energy_error: point.energy_error(),
            log_density: point.log_density(),
            index_in_trajectory: point.index_in_trajectory(),
            divergence_info: info.divergence_info,
        };

        self.draw_count += 1;
        self.state = Some(point.clone());
        Ok((point, stats))
    }

    /// Freeze the step size and switch to sampling.
    pub fn finish_warmup(&mut self) {
        if self.phase == Phase::Sampling {
            return;
        }
        let step_size = self.stepsize.finalize();
        *self.hamiltonian.step_size_mut() = step_size;
        self.phase = Phase::Sampling;
        info!("Chain {} finished warmup with step size {step_size}", self.chain);
    }

    /// Install an adapted step size and metric and switch to sampling.
    pub fn set_adaptation(&mut self, step_size: f64, metric: Metric) {
        self.stepsize = StepsizeAdapter::new(StepsizeAdaptation::Constant, step_size);
        *self.hamiltonian.step_size_mut() = step_size;
        self.hamiltonian.metric = metric;
        self.phase = Phase::Sampling;
    }
}

fn uninitialized() -> NutsError {
    NutsError::InvalidSettings("chain position is not initialized".to_string())
}
