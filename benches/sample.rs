use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mcbayes::{
    EuclideanHamiltonian, LogDensity, LogpError, Metric, MetricKind, NutsChain, NutsOptions,
    SampleOptions, Stan, StanSettings, StepsizeAdaptation, TurnCriterion,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

struct NormalLogp {
    dim: usize,
    mu: f64,
}

#[derive(Error, Debug)]
enum NormalLogpError {}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

impl LogDensity for NormalLogp {
    type LogpError = NormalLogpError;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        let mut logp = 0f64;
        for (p, g) in position.iter().zip(gradient.iter_mut()) {
            let val = *p - self.mu;
            logp -= val * val / 2.;
            *g = -val;
        }
        Ok(logp)
    }
}

fn make_chain(dim: usize) -> NutsChain<ChaCha8Rng> {
    let hamiltonian =
        EuclideanHamiltonian::new(Metric::new(MetricKind::Diagonal, dim), 1000., 0.5);
    let options = NutsOptions {
        maxdepth: 10,
        turn_criterion: TurnCriterion::default(),
    };
    NutsChain::new(
        hamiltonian,
        StepsizeAdaptation::Constant,
        options,
        ChaCha8Rng::seed_from_u64(42),
        0,
    )
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10, 1000] {
        let func = NormalLogp { dim, mu: 3. };
        let init = vec![3.5; dim];
        c.bench_function(&format!("draw normal {dim}"), |b| {
            b.iter_batched(
                || {
                    let mut chain = make_chain(dim);
                    chain
                        .set_position(&func, &init)
                        .expect("Initial point is valid");
                    chain
                },
                |mut chain| {
                    let (point, _) = chain
                        .draw(black_box(&func), 0.8)
                        .expect("Normal density can not fail");
                    black_box(point)
                },
                BatchSize::SmallInput,
            )
        });
    }

    let func = NormalLogp { dim: 100, mu: 0. };
    let mut group = c.benchmark_group("stan");
    group.sample_size(10);
    group.bench_function("sample normal 100, 4 chains", |b| {
        b.iter(|| {
            let mut sampler =
                Stan::new(100, 4, StanSettings::default()).expect("Valid settings");
            let options = SampleOptions {
                num_warmup: 200,
                num_draws: 200,
                ..Default::default()
            };
            sampler
                .sample(black_box(&func), options)
                .expect("Normal density can not fail")
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
