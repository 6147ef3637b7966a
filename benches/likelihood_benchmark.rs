use cltv::{MonetaryModelParams, MonetaryObservation, TimingModelParams, TimingObservation};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_histories(size: usize) -> Vec<TimingObservation> {
    let mut rng = StdRng::seed_from_u64(0x5EED_CAFE + size as u64);
    (0..size)
        .map(|_| {
            let t: f64 = rng.gen_range(1.0..80.0);
            let frequency: u32 = rng.gen_range(0..15);
            let recency = if frequency == 0 {
                0.0
            } else {
                rng.gen_range(0.0..t)
            };
            TimingObservation::new(frequency, recency, t)
        })
        .collect()
}

fn random_spend(size: usize) -> Vec<MonetaryObservation> {
    let mut rng = StdRng::seed_from_u64(0xCAFE_5EED + size as u64);
    (0..size)
        .map(|_| MonetaryObservation::new(rng.gen_range(1..15), rng.gen_range(5.0..500.0)))
        .collect()
}

fn benchmark_likelihoods(c: &mut Criterion) {
    let timing = TimingModelParams {
        r: 0.243,
        alpha: 4.414,
        a: 0.793,
        b: 2.426,
    };
    let monetary = MonetaryModelParams {
        p: 6.25,
        q: 3.74,
        v: 15.44,
    };

    let mut group = c.benchmark_group("mean_log_likelihood");
    for size in [1_000_usize, 20_000, 100_000] {
        group.throughput(Throughput::Elements(size as u64));

        let histories = random_histories(size);
        group.bench_with_input(BenchmarkId::new("bg_nbd", size), &histories, |b, input| {
            b.iter(|| black_box(timing.mean_log_likelihood(black_box(input))));
        });

        let spend = random_spend(size);
        group.bench_with_input(BenchmarkId::new("gamma_gamma", size), &spend, |b, input| {
            b.iter(|| black_box(monetary.mean_log_likelihood(black_box(input))));
        });
    }
    group.finish();
}

fn benchmark_predictions(c: &mut Criterion) {
    let timing = TimingModelParams {
        r: 0.243,
        alpha: 4.414,
        a: 0.793,
        b: 2.426,
    };
    let histories = random_histories(1_000);

    let mut group = c.benchmark_group("expected_transactions");
    group.throughput(Throughput::Elements(histories.len() as u64));
    for horizon in [12.0_f64, 26.07] {
        group.bench_with_input(
            BenchmarkId::from_parameter(horizon),
            &histories,
            |b, input| {
                b.iter(|| {
                    let total: f64 = input
                        .iter()
                        .filter_map(|obs| timing.expected_transactions(horizon, obs).ok())
                        .sum();
                    black_box(total)
                });
            },
        );
    }
    group.finish();
}

criterion_group!(likelihood, benchmark_likelihoods, benchmark_predictions);
criterion_main!(likelihood);
