use crate::hamiltonian::DivergenceInfo;
use crate::nuts::{Collector, NutsError, NutsOptions};
use crate::point::PSPoint;

/// Adapted step sizes are kept inside `[1e-10, 1e5]`.
pub const STEP_SIZE_BOUNDS: (f64, f64) = (1e-10, 1e5);

/// NaN maps to the lower bound.
fn clamp_log_step(log_step: f64) -> f64 {
    if log_step.is_nan() {
        return STEP_SIZE_BOUNDS.0.ln();
    }
    log_step.clamp(STEP_SIZE_BOUNDS.0.ln(), STEP_SIZE_BOUNDS.1.ln())
}

fn invalid(message: String) -> NutsError {
    NutsError::InvalidSettings(message)
}

/// Acceptance statistics that are not finite count as rejections.
fn sanitize_accept_stat(accept_stat: f64) -> f64 {
    if accept_stat.is_finite() {
        accept_stat.clamp(0., 1.)
    } else {
        0.
    }
}

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
    /// `mu = ln(bias_factor · ε₀)`
    pub bias_factor: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
            bias_factor: 10.,
        }
    }
}

impl DualAverageOptions {
    pub fn validate(&self) -> Result<(), NutsError> {
        if !(self.k > 0.5 && self.k <= 1.) {
            return Err(invalid(format!(
                "dual averaging k must be in (0.5, 1], got {}",
                self.k
            )));
        }
        if !(self.t0 >= 0. && self.t0.is_finite()) {
            return Err(invalid(format!(
                "dual averaging t0 must be >= 0, got {}",
                self.t0
            )));
        }
        if !(self.gamma > 0. && self.gamma.is_finite()) {
            return Err(invalid(format!(
                "dual averaging gamma must be positive, got {}",
                self.gamma
            )));
        }
        if !(self.bias_factor > 0. && self.bias_factor.is_finite()) {
            return Err(invalid(format!(
                "dual averaging bias_factor must be positive, got {}",
                self.bias_factor
            )));
        }
        Ok(())
    }
}

/// Nesterov dual averaging of the log step size.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (settings.bias_factor * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let accept_stat = sanitize_accept_stat(accept_stat);
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = clamp_log_step(
            self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma,
        );
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Start a new adaptation window at `initial_step`.
    ///
    /// The averaged step size is kept.
    pub fn restart(&mut self, initial_step: f64) {
        self.log_step = clamp_log_step(initial_step.ln());
        self.hbar = 0f64;
        self.mu = (self.settings.bias_factor * initial_step).ln();
        self.count = 1;
    }

    /// Switch to the averaged step size.
    pub fn finalize(&mut self) -> f64 {
        self.log_step = self.log_step_adapted;
        self.current_step_size()
    }
}

/// Settings for Adam step size adaptation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamOptions {
    /// First moment decay rate (default: 0.9)
    pub beta1: f64,
    /// Second moment decay rate (default: 0.999)
    pub beta2: f64,
    /// Small constant for numerical stability (default: 1e-8)
    pub epsilon: f64,
    /// Learning rate (default: 0.05)
    pub learning_rate: f64,
}

impl Default for AdamOptions {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            learning_rate: 0.05,
        }
    }
}

impl AdamOptions {
    pub fn validate(&self) -> Result<(), NutsError> {
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0. ..1.).contains(&beta) {
                return Err(invalid(format!("Adam {name} must be in [0, 1), got {beta}")));
            }
        }
        if !(self.learning_rate > 0. && self.learning_rate.is_finite()) {
            return Err(invalid(format!(
                "Adam learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.epsilon > 0. && self.epsilon.is_finite()) {
            return Err(invalid(format!(
                "Adam epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Single parameter Adam optimizer on the log step size.
///
/// The gradient signal is `accept_stat - target`: the step size grows while
/// the acceptance rate is above the target and shrinks while it is below.
#[derive(Debug, Clone)]
pub struct Adam {
    log_step: f64,
    m: f64,
    v: f64,
    t: u64,
    settings: AdamOptions,
}

impl Adam {
    pub fn new(settings: AdamOptions, initial_step: f64) -> Self {
        Self {
            log_step: initial_step.ln(),
            m: 0.0,
            v: 0.0,
            t: 0,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let gradient = sanitize_accept_stat(accept_stat) - target;

        self.t += 1;

        self.m = self.settings.beta1 * self.m + (1.0 - self.settings.beta1) * gradient;
        self.v = self.settings.beta2 * self.v + (1.0 - self.settings.beta2) * gradient * gradient;

        let m_hat = self.m / (1.0 - self.settings.beta1.powi(self.t as i32));
        let v_hat = self.v / (1.0 - self.settings.beta2.powi(self.t as i32));

        let update = self.settings.learning_rate * m_hat / (v_hat.sqrt() + self.settings.epsilon);
        self.log_step = clamp_log_step(self.log_step + update);
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn restart(&mut self, initial_step: f64) {
        self.log_step = clamp_log_step(initial_step.ln());
        self.m = 0.0;
        self.v = 0.0;
        self.t = 0;
    }
}

/// How a chain adapts its step size during warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepsizeAdaptation {
    /// Keep the initial step size.
    Constant,
    DualAverage(DualAverageOptions),
    Adam(AdamOptions),
}

impl Default for StepsizeAdaptation {
    fn default() -> Self {
        StepsizeAdaptation::DualAverage(DualAverageOptions::default())
    }
}

impl StepsizeAdaptation {
    pub fn validate(&self) -> Result<(), NutsError> {
        match self {
            StepsizeAdaptation::Constant => Ok(()),
            StepsizeAdaptation::DualAverage(options) => options.validate(),
            StepsizeAdaptation::Adam(options) => options.validate(),
        }
    }
}

/// The per-chain step size adapter.
#[derive(Debug, Clone)]
pub enum StepsizeAdapter {
    Constant(f64),
    DualAverage(DualAverage),
    Adam(Adam),
}

impl StepsizeAdapter {
    pub fn new(kind: StepsizeAdaptation, initial_step: f64) -> Self {
        match kind {
            StepsizeAdaptation::Constant => StepsizeAdapter::Constant(initial_step),
            StepsizeAdaptation::DualAverage(options) => {
                StepsizeAdapter::DualAverage(DualAverage::new(options, initial_step))
            }
            StepsizeAdaptation::Adam(options) => {
                StepsizeAdapter::Adam(Adam::new(options, initial_step))
            }
        }
    }

    /// Feed the acceptance statistic of the last draw.
    pub fn adapt_stepsize(&mut self, accept_stat: f64, target: f64) {
        match self {
            StepsizeAdapter::Constant(_) => {}
            StepsizeAdapter::DualAverage(inner) => inner.advance(accept_stat, target),
            StepsizeAdapter::Adam(inner) => inner.advance(accept_stat, target),
        }
    }

    /// The step size for the next draw during warmup.
    pub fn current_step_size(&self) -> f64 {
        match self {
            StepsizeAdapter::Constant(step_size) => *step_size,
            StepsizeAdapter::DualAverage(inner) => inner.current_step_size(),
            StepsizeAdapter::Adam(inner) => inner.current_step_size(),
        }
    }

    /// The step size that would be used after warmup.
    pub fn final_step_size(&self) -> f64 {
        match self {
            StepsizeAdapter::Constant(step_size) => *step_size,
            StepsizeAdapter::DualAverage(inner) => inner.current_step_size_adapted(),
            StepsizeAdapter::Adam(inner) => inner.current_step_size(),
        }
    }

    /// Start a new adaptation window at `initial_step`.
    pub fn restart(&mut self, initial_step: f64) {
        match self {
            StepsizeAdapter::Constant(_) => {}
            StepsizeAdapter::DualAverage(inner) => inner.restart(initial_step),
            StepsizeAdapter::Adam(inner) => inner.restart(initial_step),
        }
    }

    /// End adaptation and return the step size for sampling.
    pub fn finalize(&mut self) -> f64 {
        match self {
            StepsizeAdapter::Constant(step_size) => *step_size,
            StepsizeAdapter::DualAverage(inner) => inner.finalize(),
            StepsizeAdapter::Adam(inner) => inner.current_step_size(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean of `min(1, exp(H₀ − H))` over all leapfrog steps of a draw.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub(crate) fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector::default()
    }

    /// The acceptance statistic of the last draw, 0 if no leapfrog succeeded.
    pub fn accept_stat(&self) -> f64 {
        if self.mean.count() == 0 {
            0.
        } else {
            self.mean.current()
        }
    }

    /// Number of leapfrog steps of the last draw.
    pub fn n_steps(&self) -> u64 {
        self.mean.count()
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &PSPoint,
        end: &PSPoint,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => self.mean.add(0.),
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        };
    }

    fn register_init(&mut self, state: &PSPoint, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn constant_never_changes() {
        let mut adapter = StepsizeAdapter::new(StepsizeAdaptation::Constant, 0.3);
        for accept in [0., 0.5, 1., f64::NAN] {
            adapter.adapt_stepsize(accept, 0.8);
            assert_eq!(adapter.current_step_size(), 0.3);
        }
        adapter.restart(10.);
        assert_eq!(adapter.final_step_size(), 0.3);
        assert_eq!(adapter.finalize(), 0.3);
    }

    #[test]
    fn dual_average_stays_positive() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut adapter = StepsizeAdapter::new(StepsizeAdaptation::default(), 1.);
        for _ in 0..10_000 {
            adapter.adapt_stepsize(rng.random_range(0f64..1f64), 0.8);
            let step = adapter.current_step_size();
            assert!(step.is_finite() && step > 0.);
            let step = adapter.final_step_size();
            assert!(step.is_finite() && step > 0.);
        }
    }

    proptest! {
        #[test]
        fn step_size_bounded(accepts in prop::collection::vec(prop::num::f64::ANY, 1..200)) {
            for kind in [
                StepsizeAdaptation::default(),
                StepsizeAdaptation::Adam(AdamOptions::default()),
            ] {
                let mut adapter = StepsizeAdapter::new(kind, 0.5);
                for &accept in accepts.iter() {
                    adapter.adapt_stepsize(accept, 0.8);
                    let step = adapter.current_step_size();
                    prop_assert!(step >= STEP_SIZE_BOUNDS.0 * 0.999);
                    prop_assert!(step <= STEP_SIZE_BOUNDS.1 * 1.001);
                }
                let step = adapter.finalize();
                prop_assert!(step.is_finite() && step > 0.);
            }
        }
    }

    #[test]
    fn dual_average_direction() {
        let mut low = DualAverage::new(DualAverageOptions::default(), 1.);
        let mut high = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..100 {
            low.advance(0.1, 0.8);
            high.advance(1., 0.8);
        }
        assert!(low.current_step_size_adapted() < 1.);
        assert!(high.current_step_size_adapted() > 1.);
    }

    #[test]
    fn dual_average_restart_keeps_average() {
        let mut adapter = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..50 {
            adapter.advance(0.5, 0.8);
        }
        let adapted = adapter.current_step_size_adapted();
        adapter.restart(0.25);
        assert_abs_diff_eq!(adapter.current_step_size(), 0.25);
        assert_abs_diff_eq!(adapter.current_step_size_adapted(), adapted);
        assert_abs_diff_eq!(adapter.finalize(), adapted);
    }

    #[test]
    fn nan_accept_counts_as_zero() {
        let mut a = DualAverage::new(DualAverageOptions::default(), 1.);
        let mut b = DualAverage::new(DualAverageOptions::default(), 1.);
        a.advance(f64::NAN, 0.8);
        b.advance(0., 0.8);
        assert_eq!(a.current_step_size(), b.current_step_size());
    }

    #[test]
    fn nan_log_step_is_clamped() {
        assert_eq!(clamp_log_step(f64::NAN), STEP_SIZE_BOUNDS.0.ln());
        assert_eq!(clamp_log_step(f64::INFINITY), STEP_SIZE_BOUNDS.1.ln());
    }

    #[test]
    fn rejects_invalid_options() {
        assert!(StepsizeAdaptation::default().validate().is_ok());
        assert!(StepsizeAdaptation::Adam(AdamOptions::default()).validate().is_ok());
        assert!(StepsizeAdaptation::Constant.validate().is_ok());

        let dual_average_cases: [fn(&mut DualAverageOptions); 6] = [
            |options| options.bias_factor = -1.,
            |options| options.bias_factor = f64::NAN,
            |options| options.gamma = 0.,
            |options| options.t0 = -1.,
            |options| options.k = 0.5,
            |options| options.k = 1.5,
        ];
        for case in dual_average_cases {
            let mut options = DualAverageOptions::default();
            case(&mut options);
            assert!(matches!(
                StepsizeAdaptation::DualAverage(options).validate(),
                Err(NutsError::InvalidSettings(_))
            ));
        }

        let adam_cases: [fn(&mut AdamOptions); 4] = [
            |options| options.beta1 = 1.,
            |options| options.beta2 = -0.1,
            |options| options.learning_rate = 0.,
            |options| options.epsilon = 0.,
        ];
        for case in adam_cases {
            let mut options = AdamOptions::default();
            case(&mut options);
            assert!(StepsizeAdaptation::Adam(options).validate().is_err());
        }
    }

    #[test]
    fn adam_direction() {
        let mut adam = Adam::new(AdamOptions::default(), 1.);
        for _ in 0..10 {
            adam.advance(0.2, 0.8);
        }
        assert!(adam.current_step_size() < 1.);
    }
}
