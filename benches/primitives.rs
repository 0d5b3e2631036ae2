use std::time::{Duration, Instant};

use criterion::{BenchmarkGroup, BenchmarkId, Criterion, measurement::WallTime};
use ndarray::{ArrayD, IxDyn};
use polytensor::{Config, CryptoProvider, Party, Session, SharedTensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub fn primitives_benchmark(c: &mut Criterion) {
    let session = Session::new(Config::default().with_provider_seed(42)).expect("valid config");
    let parties = session.parties(&["bob", "alice"]);
    let provider = session.crypto_provider(&session.party("james"));

    let mut g = c.benchmark_group("primitives");
    for exp in [8, 10, 12] {
        let len = 2_usize.pow(exp);
        g.throughput(criterion::Throughput::Elements(len as u64));
        let setup = Setup {
            session: &session,
            parties: &parties,
            provider: &provider,
            len,
        };
        bench_op(&mut g, BenchmarkId::new("Beaver mul", len), &setup, |x, y| {
            x.mul(y)
        });
        bench_op(&mut g, BenchmarkId::new("ge", len), &setup, |x, y| x.ge(y));
        bench_op(&mut g, BenchmarkId::new("div_public", len), &setup, |x, _| {
            x.div_public(1000)
        });
    }
}

struct Setup<'a> {
    session: &'a Session,
    parties: &'a [Party],
    provider: &'a CryptoProvider,
    len: usize,
}

impl Setup<'_> {
    fn random_shared(&self, rng: &mut ChaCha20Rng) -> SharedTensor {
        let values: Vec<i64> = (0..self.len)
            .map(|_| rng.random_range(-(1 << 40)..(1 << 40)))
            .collect();
        let t = ArrayD::from_shape_vec(IxDyn(&[self.len]), values).expect("shape matches");
        self.session
            .share(&t, self.parties, Some(self.provider))
            .expect("sharing failed")
    }
}

fn bench_op(
    g: &mut BenchmarkGroup<'_, WallTime>,
    bench_id: BenchmarkId,
    setup: &Setup<'_>,
    op: impl Fn(&SharedTensor, &SharedTensor) -> polytensor::Result<SharedTensor>,
) {
    g.bench_function(bench_id, |b| {
        b.iter_custom(|iters| {
            // sharing the operands is not part of the measured time
            let mut rng = ChaCha20Rng::seed_from_u64(42);
            let mut elapsed = Duration::default();
            for _ in 0..iters {
                let x = setup.random_shared(&mut rng);
                let y = setup.random_shared(&mut rng);
                let now = Instant::now();
                let z = op(&x, &y).expect("operation failed");
                elapsed += now.elapsed();
                x.discard();
                y.discard();
                z.discard();
            }
            elapsed
        })
    });
}
