use std::time::{Duration, Instant};

use criterion::Criterion;
use ndarray::{Array2, Array4};
use polytensor::{Config, Conv2d, FixedPointTensor, Session};

pub fn layers_benchmark(c: &mut Criterion) {
    let session = Session::new(Config::default().with_provider_seed(42)).expect("valid config");
    let parties = session.parties(&["bob", "alice", "james"]);
    let provider = session.crypto_provider(&session.party("dealer"));

    let mut g = c.benchmark_group("layers");

    let image = Array4::from_shape_fn((1, 3, 16, 16), |(_, c, i, j)| {
        (c as f64 - 1.0) * 0.5 + (i * j) as f64 * 0.01
    })
    .into_dyn();
    let kernel = Array4::from_shape_fn((8, 3, 3, 3), |(o, c, i, j)| {
        ((o + c + i + j) % 5) as f64 * 0.1 - 0.2
    })
    .into_dyn();
    let weight = session.fix_prec(&kernel).expect("encodable");
    let conv = Conv2d::default().padding(1);
    g.bench_function("conv2d 3x16x16 -> 8x16x16, shared input", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::default();
            for _ in 0..iters {
                let x = session
                    .share_fixed(&image, &parties, Some(&provider))
                    .expect("sharing failed");
                let now = Instant::now();
                let y = FixedPointTensor::conv2d(&x, &weight, None, &conv).expect("conv failed");
                elapsed += now.elapsed();
                x.discard();
                y.discard();
            }
            elapsed
        })
    });

    let input = Array2::from_shape_fn((4, 64), |(i, j)| (i as f64) - (j as f64) * 0.05).into_dyn();
    let dense = Array2::from_shape_fn((10, 64), |(i, j)| ((i * j) % 7) as f64 * 0.1).into_dyn();
    g.bench_function("linear 64 -> 10 with argmax, all shared", |b| {
        b.iter_custom(|iters| {
            let mut elapsed = Duration::default();
            for _ in 0..iters {
                let x = session
                    .share_fixed(&input, &parties, Some(&provider))
                    .expect("sharing failed");
                let w = session
                    .share_fixed(&dense, &parties, Some(&provider))
                    .expect("sharing failed");
                let now = Instant::now();
                let logits = FixedPointTensor::linear(&x, &w, None).expect("linear failed");
                let label = logits.argmax(Some(1), false).expect("argmax failed");
                elapsed += now.elapsed();
                for t in [x, w, logits, label] {
                    t.discard();
                }
            }
            elapsed
        })
    });
}
