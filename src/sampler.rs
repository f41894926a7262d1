use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use faer::Mat;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::adapt_strategy::{AdaptationWindows, MetricEstimator, WarmupSchedule};
use crate::chain::{DrawStats, NutsChain, Phase};
use crate::hamiltonian::EuclideanHamiltonian;
use crate::log_density::LogDensity;
use crate::mass_matrix::{Metric, MetricKind};
use crate::nuts::{NutsError, NutsOptions};
use crate::point::{PSPoint, TurnCriterion};
use crate::stepsize::StepsizeAdaptation;

/// Initial step size, either shared by all chains or one per chain.
#[derive(Debug, Clone, PartialEq)]
pub enum StepSize {
    Scalar(f64),
    PerChain(Vec<f64>),
}

impl Default for StepSize {
    fn default() -> Self {
        StepSize::Scalar(1.)
    }
}

fn check_step_size(step_size: f64) -> Result<(), NutsError> {
    if step_size.is_finite() && step_size > 0. {
        Ok(())
    } else {
        Err(NutsError::InvalidStepSize(step_size))
    }
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone, PartialEq)]
pub struct StanSettings {
    /// Diagonal or dense euclidean metric.
    pub metric: MetricKind,
    /// The initial step size. Unless the step size is held constant this is
    /// replaced by the step size heuristic before warmup.
    pub step_size: StepSize,
    pub seed: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub stepsize_adapter: StepsizeAdaptation,
    pub turn_criterion: TurnCriterion,
    /// How many random initial points are tried before giving up.
    pub init_attempts: u64,
    /// Random initial points are drawn uniformly from `(-init_radius, init_radius)`.
    pub init_radius: f64,
}

impl Default for StanSettings {
    fn default() -> Self {
        Self {
            metric: MetricKind::Diagonal,
            step_size: StepSize::default(),
            seed: 0,
            maxdepth: 10,
            max_energy_error: 1000f64,
            stepsize_adapter: StepsizeAdaptation::default(),
            turn_criterion: TurnCriterion::default(),
            init_attempts: 100,
            init_radius: 2.,
        }
    }
}

impl StanSettings {
    fn validate(&self, chains: usize) -> Result<(), NutsError> {
        match &self.step_size {
            StepSize::Scalar(step_size) => check_step_size(*step_size)?,
            StepSize::PerChain(step_sizes) => {
                if step_sizes.len() != chains {
                    return Err(NutsError::InvalidSettings(format!(
                        "expected {chains} step sizes, got {}",
                        step_sizes.len()
                    )));
                }
                step_sizes.iter().try_for_each(|&val| check_step_size(val))?;
            }
        }
        self.stepsize_adapter.validate()?;
        if self.maxdepth == 0 {
            return Err(NutsError::InvalidSettings("maxdepth must be positive".to_string()));
        }
        if !(self.max_energy_error > 0.) {
            return Err(NutsError::InvalidSettings(format!(
                "max_energy_error must be positive, got {}",
                self.max_energy_error
            )));
        }
        if self.init_attempts == 0 {
            return Err(NutsError::InvalidSettings("init_attempts must be positive".to_string()));
        }
        if !(self.init_radius.is_finite() && self.init_radius > 0.) {
            return Err(NutsError::InvalidSettings(format!(
                "init_radius must be positive and finite, got {}",
                self.init_radius
            )));
        }
        Ok(())
    }

    fn initial_step_size(&self, chain: usize) -> f64 {
        match &self.step_size {
            StepSize::Scalar(step_size) => *step_size,
            StepSize::PerChain(step_sizes) => step_sizes[chain],
        }
    }
}

/// Stop sampling early after a number of iterations or a wall-clock duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Budget {
    /// Maximum number of iterations (warmup and sampling) per call.
    pub max_iterations: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl Budget {
    fn exceeded(&self, iterations: u64, elapsed: Duration) -> bool {
        self.max_iterations.is_some_and(|max| iterations >= max)
            | self.max_duration.is_some_and(|max| elapsed >= max)
    }
}

/// Options for a single call to [`Stan::sample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOptions {
    /// The number of warmup draws, where we fit the step size and metric.
    pub num_warmup: u64,
    /// The number of draws after warmup
    pub num_draws: u64,
    /// Target of the step size adaptation for the mean acceptance statistic.
    pub target_accept: f64,
    pub windows: AdaptationWindows,
    /// Run the chains of an iteration on the rayon thread pool.
    pub parallel: bool,
    /// Estimate a single metric from the draws of all chains.
    pub pool_metric: bool,
    /// Keep warmup draws and their statistics in the trace.
    pub save_warmup: bool,
    /// Keep the full phase space points of the draws in the trace.
    pub store_points: bool,
    pub budget: Budget,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            num_warmup: 1000,
            num_draws: 1000,
            target_accept: 0.8,
            windows: AdaptationWindows::default(),
            parallel: true,
            pool_metric: false,
            save_warmup: false,
            store_points: false,
            budget: Budget::default(),
        }
    }
}

impl SampleOptions {
    fn validate(&self) -> Result<(), NutsError> {
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(NutsError::InvalidSettings(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        Ok(())
    }
}

/// The draws of one chain.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    pub draws: Vec<Vec<f64>>,
    pub stats: Vec<DrawStats>,
    /// Phase space points of the draws, if `store_points` was set.
    pub points: Vec<PSPoint>,
    /// Warmup draws, if `save_warmup` was set.
    pub warmup_draws: Vec<Vec<f64>>,
    pub warmup_stats: Vec<DrawStats>,
}

impl ChainOutput {
    fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            draws: Vec::new(),
            stats: Vec::new(),
            points: Vec::new(),
            warmup_draws: Vec::new(),
            warmup_stats: Vec::new(),
        }
    }

    fn push(&mut self, point: PSPoint, stats: DrawStats, options: &SampleOptions) {
        if stats.tuning {
            if options.save_warmup {
                self.warmup_draws.push(point.position().to_vec());
                self.warmup_stats.push(stats);
            }
            return;
        }
        self.draws.push(point.position().to_vec());
        self.stats.push(stats);
        if options.store_points {
            self.points.push(point);
        }
    }

    /// Number of divergent draws after warmup.
    pub fn divergences(&self) -> usize {
        self.stats.iter().filter(|stats| stats.diverging).count()
    }

    /// Mean of the draws after warmup.
    pub fn mean(&self) -> Vec<f64> {
        let Some(first) = self.draws.first() else {
            return Vec::new();
        };
        let n = self.draws.len() as f64;
        let mut mean = vec![0f64; first.len()];
        for draw in self.draws.iter() {
            mean.iter_mut().zip(draw).for_each(|(m, x)| *m += x / n);
        }
        mean
    }

    /// Unbiased variance of the draws after warmup.
    pub fn variance(&self) -> Vec<f64> {
        let mean = self.mean();
        let n = self.draws.len();
        if n < 2 {
            return vec![0f64; mean.len()];
        }
        let mut var = vec![0f64; mean.len()];
        for draw in self.draws.iter() {
            var.iter_mut()
                .zip(draw.iter().zip(mean.iter()))
                .for_each(|(v, (x, m))| *v += (x - m) * (x - m));
        }
        var.iter_mut().for_each(|v| *v /= (n - 1) as f64);
        var
    }
}

#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
    /// True if the budget stopped sampling before all draws were made.
    pub cancelled: bool,
}

impl Trace {
    pub fn divergences(&self) -> usize {
        self.chains.iter().map(|chain| chain.divergences()).sum()
    }

    pub fn num_draws(&self) -> usize {
        self.chains.iter().map(|chain| chain.draws.len()).sum()
    }
}

/// The adapted step size and metric of every chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationState {
    pub step_sizes: Vec<f64>,
    pub metrics: Vec<Metric>,
}

/// Adaptive NUTS sampler running a fixed number of chains.
///
/// Chains advance in lock-step: every iteration draws once from each chain,
/// optionally in parallel. Every chain has its own random number stream, so
/// results do not depend on whether the chains run in parallel.
pub struct Stan {
    dims: usize,
    settings: StanSettings,
    chains: Vec<NutsChain<ChaCha8Rng>>,
    phase: Phase,
}

impl Stan {
    pub fn new(dims: usize, chains: usize, settings: StanSettings) -> Result<Self, NutsError> {
        if dims == 0 {
            return Err(NutsError::ZeroDimension);
        }
        if chains == 0 {
            return Err(NutsError::NoChains);
        }
        settings.validate(chains)?;

        let options = NutsOptions {
            maxdepth: settings.maxdepth,
            turn_criterion: settings.turn_criterion,
        };
        let chains = (0..chains)
            .map(|chain| {
                let hamiltonian = EuclideanHamiltonian::new(
                    Metric::new(settings.metric, dims),
                    settings.max_energy_error,
                    settings.initial_step_size(chain),
                );
                let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
                rng.set_stream(chain as u64);
                NutsChain::new(
                    hamiltonian,
                    settings.stepsize_adapter,
                    options,
                    rng,
                    chain as u64,
                )
            })
            .collect();

        Ok(Self {
            dims,
            settings,
            chains,
            phase: Phase::Warmup,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn settings(&self) -> &StanSettings {
        &self.settings
    }

    /// `Warmup` until warmup has completed once.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn chains(&self) -> &[NutsChain<ChaCha8Rng>] {
        &self.chains
    }

    /// Set the initial position of every chain.
    pub fn set_positions<D: LogDensity>(
        &mut self,
        density: &D,
        positions: &[Vec<f64>],
    ) -> Result<(), NutsError> {
        if positions.len() != self.chains.len() {
            return Err(NutsError::DimensionMismatch {
                expected: self.chains.len(),
                found: positions.len(),
            });
        }
        self.chains
            .iter_mut()
            .zip(positions)
            .try_for_each(|(chain, position)| chain.set_position(density, position))
    }

    pub fn adaptation_state(&self) -> AdaptationState {
        AdaptationState {
            step_sizes: self.chains.iter().map(|chain| chain.step_size()).collect(),
            metrics: self.chains.iter().map(|chain| chain.metric().clone()).collect(),
        }
    }

    /// Install a previously adapted step size and metric for every chain.
    ///
    /// The sampler counts as adapted afterwards, so later calls to
    /// [`Stan::sample`] skip warmup.
    pub fn set_adaptation_state(&mut self, state: AdaptationState) -> Result<(), NutsError> {
        let chains = self.chains.len();
        if state.step_sizes.len() != chains || state.metrics.len() != chains {
            return Err(NutsError::InvalidSettings(format!(
                "adaptation state for {} chains, sampler has {chains}",
                state.step_sizes.len().max(state.metrics.len()),
            )));
        }
        for (&step_size, metric) in state.step_sizes.iter().zip(state.metrics.iter()) {
            check_step_size(step_size)?;
            if metric.dim() != self.dims {
                return Err(NutsError::DimensionMismatch {
                    expected: self.dims,
                    found: metric.dim(),
                });
            }
            if metric.kind() != self.settings.metric {
                return Err(NutsError::InvalidSettings(format!(
                    "expected a {:?} metric, got {:?}",
                    self.settings.metric,
                    metric.kind()
                )));
            }
        }
        for ((chain, step_size), metric) in self
            .chains
            .iter_mut()
            .zip(state.step_sizes)
            .zip(state.metrics)
        {
            chain.set_adaptation(step_size, metric);
        }
        self.phase = Phase::Sampling;
        Ok(())
    }

    /// Run warmup (unless the sampler is already adapted) followed by
    /// `num_draws` draws per chain.
    pub fn sample<D: LogDensity>(&mut self, density: &D, options: SampleOptions) -> Result<Trace> {
        options.validate().context("Invalid sample options")?;
        if density.dim() != self.dims {
            return Err(NutsError::DimensionMismatch {
                expected: self.dims,
                found: density.dim(),
            })
            .context("Log density does not match the sampler dimension");
        }

        let radius = self.settings.init_radius;
        let attempts = self.settings.init_attempts;
        for chain in self.chains.iter_mut() {
            if chain.current_point().is_none() {
                chain
                    .init_random(density, radius, attempts)
                    .with_context(|| {
                        format!("All initialization points of chain {} failed", chain.chain())
                    })?;
            }
        }

        let num_warmup = if self.phase == Phase::Sampling && options.num_warmup > 0 {
            warn!(
                "Sampler is already adapted, skipping {} warmup draws",
                options.num_warmup
            );
            0
        } else {
            options.num_warmup
        };

        if num_warmup == 0 {
            self.chains.iter_mut().for_each(|chain| chain.finish_warmup());
            self.phase = Phase::Sampling;
        }

        let schedule = options.windows.schedule(num_warmup);
        let columns = if options.pool_metric {
            1
        } else {
            self.chains.len()
        };
        let mut estimator = MetricEstimator::new(self.settings.metric, self.dims, columns);

        if num_warmup > 0 {
            self.init_step_sizes(density, options.target_accept)?;
        }

        let mut outputs: Vec<ChainOutput> = self
            .chains
            .iter()
            .map(|chain| ChainOutput::new(chain.chain()))
            .collect();

        let total = num_warmup + options.num_draws;
        let start = Instant::now();
        let mut cancelled = false;
        for iteration in 0..total {
            if options.budget.exceeded(iteration, start.elapsed()) {
                warn!("Sampling budget exhausted after {iteration} of {total} iterations");
                cancelled = true;
                break;
            }

            let target_accept = options.target_accept;
            let results: Vec<_> = if options.parallel {
                self.chains
                    .par_iter_mut()
                    .map(|chain| chain.draw(density, target_accept))
                    .collect()
            } else {
                self.chains
                    .iter_mut()
                    .map(|chain| chain.draw(density, target_accept))
                    .collect()
            };

            let mut draws = Vec::with_capacity(results.len());
            for (output, result) in outputs.iter().zip(results) {
                let draw = result.with_context(|| {
                    format!(
                        "Chain {} failed at iteration {iteration}",
                        output.chain_id
                    )
                })?;
                draws.push(draw);
            }

            if iteration < num_warmup {
                let positions = Mat::from_fn(self.dims, draws.len(), |i, j| {
                    draws[j].0.position()[i]
                });
                self.adapt(density, iteration, &schedule, &mut estimator, &positions, &options)?;
            }

            for (output, (point, stats)) in outputs.iter_mut().zip(draws) {
                output.push(point, stats, &options);
            }
        }

        for output in outputs.iter() {
            info!(
                "Chain {} finished with {} draws and {} divergences",
                output.chain_id,
                output.draws.len(),
                output.divergences()
            );
        }

        Ok(Trace {
            chains: outputs,
            cancelled,
        })
    }

    fn adapts_step_size(&self) -> bool {
        !matches!(self.settings.stepsize_adapter, StepsizeAdaptation::Constant)
    }

    fn init_step_sizes<D: LogDensity>(&mut self, density: &D, target_accept: f64) -> Result<()> {
        if !self.adapts_step_size() {
            return Ok(());
        }
        for chain in self.chains.iter_mut() {
            chain
                .init_step_size(density, target_accept)
                .with_context(|| {
                    format!("Could not initialize step size of chain {}", chain.chain())
                })?;
        }
        Ok(())
    }

    /// Metric adaptation and window bookkeeping after warmup iteration `iteration`.
    fn adapt<D: LogDensity>(
        &mut self,
        density: &D,
        iteration: u64,
        schedule: &WarmupSchedule,
        estimator: &mut MetricEstimator,
        positions: &Mat<f64>,
        options: &SampleOptions,
    ) -> Result<()> {
        estimator.set_update_enabled(schedule.in_slow_window(iteration));
        estimator
            .update(positions.as_ref())
            .context("Could not update the metric estimate")?;

        if let Some(window) = schedule.ends_slow_window(iteration) {
            let pooled = estimator.columns() == 1;
            for (j, chain) in self.chains.iter_mut().enumerate() {
                let column = if pooled { 0 } else { j };
                estimator.refresh(column, chain.metric_mut());
            }
            estimator.reset();
            self.init_step_sizes(density, options.target_accept)?;
            debug!(
                "Adaptation window {window} ended at iteration {iteration}, step sizes {:?}",
                self.chains
                    .iter()
                    .map(|chain| chain.step_size())
                    .collect::<Vec<_>>()
            );
        }

        if schedule.is_last_warmup_draw(iteration) {
            self.chains.iter_mut().for_each(|chain| chain.finish_warmup());
            self.phase = Phase::Sampling;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_density::test_logps::NormalLogp;
    use crate::mass_matrix::{DenseMassMatrix, DiagMassMatrix};
    use crate::stepsize::{AdamOptions, DualAverageOptions};
    use pretty_assertions::assert_eq;

    fn small_options() -> SampleOptions {
        SampleOptions {
            num_warmup: 100,
            num_draws: 50,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            Stan::new(0, 4, StanSettings::default()),
            Err(NutsError::ZeroDimension)
        ));
        assert!(matches!(
            Stan::new(3, 0, StanSettings::default()),
            Err(NutsError::NoChains)
        ));
        let settings = StanSettings {
            step_size: StepSize::Scalar(-1.),
            ..Default::default()
        };
        assert!(matches!(
            Stan::new(3, 2, settings),
            Err(NutsError::InvalidStepSize(_))
        ));
        let settings = StanSettings {
            step_size: StepSize::PerChain(vec![0.1, 0.2, 0.3]),
            ..Default::default()
        };
        assert!(matches!(
            Stan::new(3, 2, settings),
            Err(NutsError::InvalidSettings(_))
        ));
        let settings = StanSettings {
            step_size: StepSize::PerChain(vec![0.1, f64::NAN]),
            ..Default::default()
        };
        assert!(Stan::new(3, 2, settings).is_err());
        let settings = StanSettings {
            stepsize_adapter: StepsizeAdaptation::DualAverage(DualAverageOptions {
                bias_factor: -1.,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            Stan::new(1, 1, settings),
            Err(NutsError::InvalidSettings(_))
        ));
        let settings = StanSettings {
            stepsize_adapter: StepsizeAdaptation::Adam(AdamOptions {
                learning_rate: -0.1,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(Stan::new(1, 1, settings).is_err());
        let settings = StanSettings {
            maxdepth: 0,
            ..Default::default()
        };
        assert!(Stan::new(3, 2, settings).is_err());
        let settings = StanSettings {
            max_energy_error: 0.,
            ..Default::default()
        };
        assert!(Stan::new(3, 2, settings).is_err());

        let mut sampler = Stan::new(3, 2, StanSettings::default()).unwrap();
        let options = SampleOptions {
            target_accept: 1.,
            ..small_options()
        };
        assert!(sampler.sample(&NormalLogp::new(3, 0.), options).is_err());
        assert!(sampler.sample(&NormalLogp::new(4, 0.), small_options()).is_err());
        assert!(sampler
            .set_positions(&NormalLogp::new(3, 0.), &[vec![0.; 3]])
            .is_err());
    }

    #[test]
    fn sample_shapes() -> Result<()> {
        let func = NormalLogp::new(5, 0.1);
        let mut sampler = Stan::new(5, 3, StanSettings::default())?;
        assert_eq!(sampler.phase(), Phase::Warmup);
        let options = SampleOptions {
            save_warmup: true,
            store_points: true,
            ..small_options()
        };
        let trace = sampler.sample(&func, options)?;
        assert!(!trace.cancelled);
        assert_eq!(trace.chains.len(), 3);
        assert_eq!(sampler.phase(), Phase::Sampling);
        for (i, chain) in trace.chains.iter().enumerate() {
            assert_eq!(chain.chain_id, i as u64);
            assert_eq!(chain.draws.len(), 50);
            assert_eq!(chain.points.len(), 50);
            assert_eq!(chain.warmup_draws.len(), 100);
            assert!(chain.warmup_stats.iter().all(|stats| stats.tuning));
            assert!(chain.stats.iter().all(|stats| !stats.tuning));
            assert_eq!(chain.stats[0].draw, 100);
            assert!(chain.draws.iter().all(|draw| draw.len() == 5));
            assert_eq!(chain.mean().len(), 5);
            let step_size = chain.stats[0].step_size;
            assert!(chain.stats.iter().all(|stats| stats.step_size == step_size));
        }
        Ok(())
    }

    #[test]
    fn sequential_equals_parallel() -> Result<()> {
        let func = NormalLogp::new(4, 0.);
        let settings = StanSettings {
            seed: 42,
            ..Default::default()
        };
        let options = small_options();
        let mut seq = Stan::new(4, 3, settings.clone())?;
        let mut par = Stan::new(4, 3, settings)?;
        let seq = seq.sample(
            &func,
            SampleOptions {
                parallel: false,
                ..options
            },
        )?;
        let par = par.sample(
            &func,
            SampleOptions {
                parallel: true,
                ..options
            },
        )?;
        for (a, b) in seq.chains.iter().zip(par.chains.iter()) {
            assert_eq!(a.draws, b.draws);
        }
        // Different chains use different random streams.
        assert!(seq.chains[0].draws != seq.chains[1].draws);
        Ok(())
    }

    #[test]
    fn budget_cancels() -> Result<()> {
        let func = NormalLogp::new(2, 0.);
        let mut sampler = Stan::new(2, 2, StanSettings::default())?;
        let options = SampleOptions {
            num_warmup: 20,
            num_draws: 100,
            budget: Budget {
                max_iterations: Some(50),
                max_duration: None,
            },
            ..Default::default()
        };
        let trace = sampler.sample(&func, options)?;
        assert!(trace.cancelled);
        assert!(trace.chains.iter().all(|chain| chain.draws.len() == 30));

        let options = SampleOptions {
            budget: Budget {
                max_iterations: None,
                max_duration: Some(Duration::ZERO),
            },
            ..Default::default()
        };
        let trace = sampler.sample(&func, options)?;
        assert!(trace.cancelled);
        assert_eq!(trace.num_draws(), 0);
        Ok(())
    }

    #[test]
    fn adaptation_state_skips_warmup() -> Result<()> {
        let func = NormalLogp::new(3, 0.);
        let mut sampler = Stan::new(3, 2, StanSettings::default())?;
        let state = AdaptationState {
            step_sizes: vec![0.5, 0.6],
            metrics: vec![
                Metric::Diagonal(DiagMassMatrix::from_variance(&[1., 2., 3.])?),
                Metric::new(MetricKind::Diagonal, 3),
            ],
        };
        sampler.set_adaptation_state(state.clone())?;
        assert_eq!(sampler.phase(), Phase::Sampling);
        assert_eq!(sampler.adaptation_state(), state);

        let options = SampleOptions {
            save_warmup: true,
            ..small_options()
        };
        let trace = sampler.sample(&func, options)?;
        for (chain, step_size) in trace.chains.iter().zip([0.5, 0.6]) {
            assert!(chain.warmup_draws.is_empty());
            assert_eq!(chain.draws.len(), 50);
            assert!(chain.stats.iter().all(|stats| stats.step_size == step_size));
        }

        let bad = AdaptationState {
            step_sizes: vec![0.5],
            metrics: vec![Metric::new(MetricKind::Diagonal, 3)],
        };
        assert!(sampler.set_adaptation_state(bad).is_err());
        let bad = AdaptationState {
            step_sizes: vec![0.5, 0.5],
            metrics: vec![Metric::new(MetricKind::Dense, 3); 2],
        };
        assert!(sampler.set_adaptation_state(bad).is_err());
        Ok(())
    }

    #[test]
    fn dense_adaptation_state() -> Result<()> {
        let func = NormalLogp::new(2, 0.);
        let settings = StanSettings {
            metric: MetricKind::Dense,
            ..Default::default()
        };
        let mut sampler = Stan::new(2, 1, settings)?;
        assert!(DenseMassMatrix::from_covariance(2, &[1., 2., 2., 1.]).is_err());
        assert!(DenseMassMatrix::from_covariance(2, &[1., 0.5, 0.4, 1.]).is_err());

        let metric = DenseMassMatrix::from_covariance(2, &[2., 0.5, 0.5, 1.])?;
        let state = AdaptationState {
            step_sizes: vec![0.7],
            metrics: vec![Metric::Dense(metric)],
        };
        sampler.set_adaptation_state(state.clone())?;
        assert_eq!(sampler.adaptation_state(), state);
        let trace = sampler.sample(&func, small_options())?;
        assert_eq!(trace.num_draws(), 50);
        Ok(())
    }

    #[test]
    fn second_call_skips_warmup() -> Result<()> {
        let func = NormalLogp::new(2, 0.);
        let mut sampler = Stan::new(2, 1, StanSettings::default())?;
        sampler.sample(&func, small_options())?;
        let adapted = sampler.adaptation_state();
        let options = SampleOptions {
            save_warmup: true,
            ..small_options()
        };
        let trace = sampler.sample(&func, options)?;
        assert!(trace.chains[0].warmup_draws.is_empty());
        assert_eq!(trace.chains[0].draws.len(), 50);
        assert_eq!(sampler.adaptation_state(), adapted);
        Ok(())
    }

    #[test]
    fn user_positions() -> Result<()> {
        let func = NormalLogp::new(2, 0.);
        let mut sampler = Stan::new(2, 2, StanSettings::default())?;
        sampler.set_positions(&func, &[vec![0.1, 0.2], vec![-0.3, 0.4]])?;
        assert_eq!(
            sampler.chains()[1].current_point().map(|p| p.position().to_vec()),
            Some(vec![-0.3, 0.4])
        );
        let options = SampleOptions {
            pool_metric: true,
            ..small_options()
        };
        let trace = sampler.sample(&func, options)?;
        assert_eq!(trace.num_draws(), 100);
        let state = sampler.adaptation_state();
        // A pooled estimate gives every chain the same metric.
        assert_eq!(state.metrics[0], state.metrics[1]);
        Ok(())
    }
}
