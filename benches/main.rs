//! Benchmarks of the sharing protocols and of the layers built from them.

use std::time::Duration;

use criterion::Criterion;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

mod layers;
mod primitives;

fn main() {
    // RUST_LOG overrides the default of warnings only
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("polytensor=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .init();

    let mut c = Criterion::default()
        .sample_size(10)
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_secs(5))
        .configure_from_args();

    for bench in [primitives::primitives_benchmark, layers::layers_benchmark] {
        bench(&mut c);
    }

    c.final_summary();
}
