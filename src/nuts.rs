use thiserror::Error;

use crate::hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LeapfrogResult};
use crate::log_density::LogDensity;
use crate::math::logaddexp;
use crate::point::{PSPoint, TurnCriterion};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not find a valid initial point")]
    BadInitGrad(),

    #[error("Expected a vector of length {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Step size must be positive and finite, got {0}")]
    InvalidStepSize(f64),

    #[error("The number of chains must be positive")]
    NoChains,

    #[error("The number of dimensions must be positive")]
    ZeroDimension,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Callbacks for various events during a Nuts sampling step.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &PSPoint,
        _end: &PSPoint,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &PSPoint, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &PSPoint, _options: &NutsOptions) {}
}

impl Collector for () {}

impl<A: Collector, B: Collector> Collector for (A, B) {
    fn register_leapfrog(
        &mut self,
        start: &PSPoint,
        end: &PSPoint,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.0.register_leapfrog(start, end, divergence_info);
        self.1.register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &PSPoint, info: &SampleInfo) {
        self.0.register_draw(state, info);
        self.1.register_draw(state, info);
    }

    fn register_init(&mut self, state: &PSPoint, options: &NutsOptions) {
        self.0.register_init(state, options);
        self.1.register_init(state, options);
    }
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
    pub turn_criterion: TurnCriterion,
}

/// A part of the trajectory tree during NUTS sampling.
struct NutsTree {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: PSPoint,
    right: PSPoint,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: PSPoint,
    log_size: f64,
    depth: u64,

    /// A tree is the main tree if it contains the initial point
    /// of the trajectory.
    is_main: bool,
}

enum ExtendResult<E> {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree),
    /// An unrecoverable error happend during a leapfrog step
    Err(E),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree),
    /// A divergence happend during tree extension.
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(point: PSPoint) -> NutsTree {
        NutsTree {
            right: point.clone(),
            left: point.clone(),
            draw: point,
            depth: 0,
            log_size: 0.,
            is_main: true,
        }
    }

    fn leaf(point: PSPoint) -> NutsTree {
        let log_size = point.log_weight();
        NutsTree {
            right: point.clone(),
            left: point.clone(),
            draw: point,
            depth: 0,
            log_size,
            is_main: false,
        }
    }

    fn endpoint(&self, direction: Direction) -> &PSPoint {
        match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        }
    }

    /// Double the tree by building a subtree of the same depth next to it.
    ///
    /// The new subtree is built bottom-up: finished subtrees of equal depth
    /// are merged like the digits of a binary counter, so at most
    /// `self.depth` partial subtrees are alive at any time.
    fn extend<D, R, C>(
        mut self,
        density: &D,
        rng: &mut R,
        hamiltonian: &EuclideanHamiltonian,
        direction: Direction,
        options: &NutsOptions,
        collector: &mut C,
    ) -> ExtendResult<D::LogpError>
    where
        D: LogDensity,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut stack: Vec<NutsTree> = Vec::with_capacity(self.depth as usize);

        let other = loop {
            let start = match stack.last() {
                Some(tree) => tree.endpoint(direction),
                None => self.endpoint(direction),
            };
            let mut current = match hamiltonian.leapfrog(density, start, direction, collector) {
                LeapfrogResult::Ok(end) => NutsTree::leaf(end),
                LeapfrogResult::Divergence(info) => {
                    return ExtendResult::Diverging(self, info);
                }
                LeapfrogResult::Err(error) => return ExtendResult::Err(error),
            };

            while stack.last().is_some_and(|tree| tree.depth == current.depth) {
                let Some(mut earlier) = stack.pop() else {
                    unreachable!()
                };
                let turning = earlier.is_turning_with(&current, direction, options);
                earlier.merge_into(current, rng, direction);
                if turning {
                    return ExtendResult::Turning(self);
                }
                current = earlier;
            }

            if current.depth == self.depth {
                break current;
            }
            stack.push(current);
        };

        let turning = self.is_turning_with(&other, direction, options);
        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    /// Check the termination criterion for the merge of `self` with `other`,
    /// where `other` lies next to `self` in `direction`.
    fn is_turning_with(
        &self,
        other: &NutsTree,
        direction: Direction,
        options: &NutsOptions,
    ) -> bool {
        let criterion = options.turn_criterion;
        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last, criterion);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right, criterion);
            }
            if !turning {
                turning = self.left.is_turning(&other.left, criterion);
            }
        }
        turning
    }

    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if other.log_size >= self_log_size
            || rng.random_bool((other.log_size - self_log_size).exp())
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

/// Run one NUTS transition starting at `init`.
///
/// The momentum of `init` is resampled. Returns the selected point, which is
/// `init` itself or one of the points of the trajectory.
pub(crate) fn draw<D, R, C>(
    density: &D,
    init: &mut PSPoint,
    rng: &mut R,
    hamiltonian: &EuclideanHamiltonian,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(PSPoint, SampleInfo)>
where
    D: LogDensity,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    hamiltonian.initialize_trajectory(init, rng);
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(density, rng, hamiltonian, direction, options, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(NutsError::LogpFailure(Box::new(error)));
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}
