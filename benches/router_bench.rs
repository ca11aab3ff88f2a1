use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use train_control::{
    host::{
        instance::InstanceState,
        router::{DataRouter, ROUTER_CAPACITY},
    },
    telemetry::{PidSample, TelemetrySample},
};

fn router_push_bench(c: &mut Criterion) {
    let state = InstanceState::shared();
    let router = DataRouter::start("bench", state.clone(), ROUTER_CAPACITY).unwrap();

    let sample = TelemetrySample::Pid(PidSample {
        elapsed_s: 1.0,
        input: 10.8,
        reference: 10.0,
        error: 0.8,
        kp: 50.0,
        ki: 0.0,
        kd: 0.0,
        output: 40.0,
    });

    // no sink: the consumer only updates the latest sample; overflow drops count too
    c.bench_function("router_push", |b| {
        b.iter(|| {
            let _ = router.push(black_box(sample));
        })
    });

    router.shutdown();
}

criterion_group!(benches, router_push_bench);
criterion_main!(benches);
