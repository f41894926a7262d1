//! Adaptive Hamiltonian Monte Carlo with the No-U-Turn Sampler.
//!
//! The sampler follows the adaptation scheme of Stan: a windowed warmup that
//! tunes the step size with dual averaging and estimates a diagonal or dense
//! euclidean metric from the draws of the slow windows. Any number of chains
//! run in lock-step, optionally on the rayon thread pool.
//!
//! # Example
//!
//! ```
//! use mcbayes::{FnLogDensity, SampleOptions, Stan, StanSettings};
//!
//! // A standard normal in two dimensions.
//! let density = FnLogDensity::new(2, |x: &[f64]| {
//!     let logp = -0.5 * x.iter().map(|v| v * v).sum::<f64>();
//!     (logp, x.iter().map(|v| -v).collect())
//! });
//!
//! let mut sampler = Stan::new(2, 4, StanSettings::default())?;
//! let options = SampleOptions {
//!     num_warmup: 200,
//!     num_draws: 200,
//!     ..Default::default()
//! };
//! let trace = sampler.sample(&density, options)?;
//! assert_eq!(trace.chains.len(), 4);
//! assert!(trace.chains.iter().all(|chain| chain.draws.len() == 200));
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Implement [`LogDensity`] directly to avoid allocating a gradient vector
//! per evaluation, or to report errors that the sampler should treat as
//! divergences (see [`LogpError::is_recoverable`]).

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod hamiltonian;
pub(crate) mod log_density;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod moments;
pub(crate) mod nuts;
pub(crate) mod point;
pub(crate) mod sampler;
pub(crate) mod stepsize;

pub use adapt_strategy::{find_reasonable_step_size, AdaptationWindows, WarmupSchedule};
pub use chain::{DrawStats, NutsChain, Phase};
pub use hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LeapfrogResult};
pub use log_density::{FnLogDensity, FnLogDensityError, LogDensity, LogpError};
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix, Metric, MetricKind};
pub use moments::{OnlineCovariance, OnlineMoments};
pub use nuts::{Collector, NutsError, NutsOptions, SampleInfo};
pub use point::{PSPoint, TurnCriterion};
pub use sampler::{
    AdaptationState, Budget, ChainOutput, SampleOptions, StanSettings, Stan, StepSize, Trace,
};
pub use stepsize::{
    AcceptanceRateCollector, Adam, AdamOptions, DualAverage, DualAverageOptions,
    StepsizeAdaptation, StepsizeAdapter,
};
