use std::ops::Range;

use faer::MatRef;
use log::{debug, warn};

use crate::hamiltonian::{Direction, EuclideanHamiltonian, LeapfrogResult};
use crate::log_density::LogDensity;
use crate::mass_matrix::{Metric, MetricKind};
use crate::moments::{OnlineCovariance, OnlineMoments};
use crate::nuts::{Collector, NutsError, NutsOptions};
use crate::point::{PSPoint, TurnCriterion};
use crate::stepsize::{AcceptanceRateCollector, STEP_SIZE_BOUNDS};

/// Warmup runs shorter than this only adapt the step size.
const MIN_WINDOWED_WARMUP: u64 = 20;

/// Configuration of the windowed warmup.
///
/// Warmup starts with a fast phase of `init_buffer` draws that only adapts
/// the step size, continues with slow windows that estimate the metric, the
/// first `base_window` long and every following one twice as long as its
/// predecessor, and ends with `term_buffer` draws that adapt the step size
/// to the final metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptationWindows {
    pub init_buffer: u64,
    pub term_buffer: u64,
    pub base_window: u64,
}

impl Default for AdaptationWindows {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
        }
    }
}

impl AdaptationWindows {
    /// Lay out the windows for a warmup of `num_warmup` draws.
    ///
    /// If the buffers and the first window do not fit into the warmup they
    /// are replaced by 15% of the warmup for the initial buffer, 10% for the
    /// terminal buffer and a single slow window in between.
    pub fn schedule(&self, num_warmup: u64) -> WarmupSchedule {
        if num_warmup < MIN_WINDOWED_WARMUP {
            return WarmupSchedule {
                num_warmup,
                init_buffer: num_warmup,
                term_buffer: 0,
                slow_windows: Vec::new(),
            };
        }

        let (init_buffer, term_buffer, base_window) =
            if self.init_buffer + self.term_buffer + self.base_window > num_warmup {
                let init_buffer = (0.15 * num_warmup as f64) as u64;
                let term_buffer = (0.1 * num_warmup as f64) as u64;
                (
                    init_buffer,
                    term_buffer,
                    num_warmup - init_buffer - term_buffer,
                )
            } else {
                (self.init_buffer, self.term_buffer, self.base_window)
            };

        let slow_end = num_warmup - term_buffer;
        let mut slow_windows = Vec::new();
        let mut start = init_buffer;
        let mut size = base_window.max(1);
        while start < slow_end {
            let mut end = (start + size).min(slow_end);
            if !slow_windows.is_empty() && end + 2 * size > slow_end {
                end = slow_end;
            }
            slow_windows.push(start..end);
            start = end;
            size *= 2;
        }

        WarmupSchedule {
            num_warmup,
            init_buffer,
            term_buffer,
            slow_windows,
        }
    }
}

/// The concrete warmup layout for a given number of warmup draws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupSchedule {
    pub num_warmup: u64,
    pub init_buffer: u64,
    pub term_buffer: u64,
    /// Draw indices of the slow windows, in order.
    pub slow_windows: Vec<Range<u64>>,
}

impl WarmupSchedule {
    /// Whether the draw with index `draw` contributes to the metric estimate.
    pub fn in_slow_window(&self, draw: u64) -> bool {
        self.slow_windows.iter().any(|window| window.contains(&draw))
    }

    /// If `draw` is the last draw of a slow window, return the window index.
    pub fn ends_slow_window(&self, draw: u64) -> Option<usize> {
        self.slow_windows
            .iter()
            .position(|window| window.end.checked_sub(1) == Some(draw))
    }

    pub fn is_last_warmup_draw(&self, draw: u64) -> bool {
        draw + 1 == self.num_warmup
    }
}

/// Running estimate of the draw (co)variance that the metric is fitted to.
#[derive(Debug, Clone)]
pub(crate) enum MetricEstimator {
    Diagonal(OnlineMoments),
    Dense(OnlineCovariance),
}

impl MetricEstimator {
    pub(crate) fn new(kind: MetricKind, dim: usize, columns: usize) -> Self {
        match kind {
            MetricKind::Diagonal => MetricEstimator::Diagonal(OnlineMoments::new(dim, columns)),
            MetricKind::Dense => MetricEstimator::Dense(OnlineCovariance::new(dim, columns)),
        }
    }

    pub(crate) fn columns(&self) -> usize {
        match self {
            MetricEstimator::Diagonal(inner) => inner.columns(),
            MetricEstimator::Dense(inner) => inner.columns(),
        }
    }

    pub(crate) fn update(&mut self, draws: MatRef<'_, f64>) -> Result<(), NutsError> {
        match self {
            MetricEstimator::Diagonal(inner) => inner.update(draws),
            MetricEstimator::Dense(inner) => inner.update(draws),
        }
    }

    pub(crate) fn set_update_enabled(&mut self, enabled: bool) {
        match self {
            MetricEstimator::Diagonal(inner) => inner.set_update_enabled(enabled),
            MetricEstimator::Dense(inner) => inner.set_update_enabled(enabled),
        }
    }

    pub(crate) fn reset(&mut self) {
        match self {
            MetricEstimator::Diagonal(inner) => inner.reset(),
            MetricEstimator::Dense(inner) => inner.reset(),
        }
    }

    /// Replace `metric` by the regularized estimate of column `column`.
    ///
    /// Returns false if the previous metric was kept.
    pub(crate) fn refresh(&self, column: usize, metric: &mut Metric) -> bool {
        match (self, metric) {
            (MetricEstimator::Diagonal(moments), Metric::Diagonal(mass)) => {
                let count = moments.count()[column];
                if count < 2 {
                    return false;
                }
                let variance = moments.variance();
                let variance: Vec<f64> =
                    (0..moments.dim()).map(|i| variance[(i, column)]).collect();
                mass.update_from_variance(&variance, count);
                true
            }
            (MetricEstimator::Dense(moments), Metric::Dense(mass)) => {
                let count = moments.count()[column];
                if count < 2 {
                    return false;
                }
                let ok = mass.update_from_covariance(moments.covariance(column), count);
                if !ok {
                    warn!("Covariance estimate is not positive definite, keeping the metric");
                }
                ok
            }
            _ => false,
        }
    }
}

/// Find an initial step size with a single leapfrog step acceptance
/// close to `target_accept`.
///
/// Starting from the current step size of `hamiltonian`, the step size is
/// doubled while the acceptance statistic stays above the target, or halved
/// while it stays below. The step size of `hamiltonian` is set to the result.
pub fn find_reasonable_step_size<D, R>(
    density: &D,
    hamiltonian: &mut EuclideanHamiltonian,
    point: &PSPoint,
    target_accept: f64,
    rng: &mut R,
) -> Result<f64, NutsError>
where
    D: LogDensity,
    R: rand::Rng + ?Sized,
{
    let initial_step = hamiltonian.step_size();
    let options = NutsOptions {
        maxdepth: 1,
        turn_criterion: TurnCriterion::default(),
    };

    let accept_stat = |hamiltonian: &EuclideanHamiltonian, state: &PSPoint| {
        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(state, &options);
        match hamiltonian.leapfrog(density, state, Direction::Forward, &mut collector) {
            LeapfrogResult::Err(err) => Err(NutsError::LogpFailure(Box::new(err))),
            _ => Ok(collector.accept_stat()),
        }
    };

    // Fixed by the first trial.
    let mut dir = None;
    for _ in 0..100 {
        let mut state = point.clone();
        hamiltonian.initialize_trajectory(&mut state, rng);
        let accept = accept_stat(hamiltonian, &state)?;
        let step_size = hamiltonian.step_size();
        let dir = *dir.get_or_insert(if accept > target_accept {
            Direction::Forward
        } else {
            Direction::Backward
        });
        match dir {
            Direction::Forward => {
                if (accept <= target_accept) | (step_size > STEP_SIZE_BOUNDS.1) {
                    return Ok(finish(hamiltonian, initial_step, step_size));
                }
                *hamiltonian.step_size_mut() *= 2.;
            }
            Direction::Backward => {
                if (accept >= target_accept) | (step_size < STEP_SIZE_BOUNDS.0) {
                    return Ok(finish(hamiltonian, initial_step, step_size));
                }
                *hamiltonian.step_size_mut() /= 2.;
            }
        }
    }

    // If we don't find something better, use the initial value
    *hamiltonian.step_size_mut() = initial_step;
    Ok(initial_step)
}

fn finish(hamiltonian: &mut EuclideanHamiltonian, initial_step: f64, step_size: f64) -> f64 {
    let step_size = step_size.clamp(STEP_SIZE_BOUNDS.0, STEP_SIZE_BOUNDS.1);
    debug!("Initial step size heuristic: {initial_step} -> {step_size}");
    *hamiltonian.step_size_mut() = step_size;
    step_size
}
