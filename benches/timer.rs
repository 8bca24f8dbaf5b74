use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use mainloop::{MainLoop, PostAction};

fn single(c: &mut Criterion) {
    let event_loop = MainLoop::new().unwrap();

    // An idle source keeps every step non-blocking.
    event_loop.add_idle(|| PostAction::Continue).unwrap();

    let mut timeout = event_loop
        .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
        .unwrap();

    c.bench_function("extend_single", |b| {
        b.iter(|| {
            timeout.close();

            timeout = event_loop
                .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
                .unwrap();

            event_loop.step().unwrap();
        });
    });
}

fn mixed(c: &mut Criterion) {
    let event_loop = MainLoop::new().unwrap();

    event_loop.add_idle(|| PostAction::Continue).unwrap();

    event_loop
        .add_timeout(Duration::from_secs(60 * 10 - 1), |_| PostAction::Remove)
        .unwrap();

    let mut timeout = event_loop
        .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
        .unwrap();

    event_loop
        .add_timeout(Duration::from_secs(90 * 10), |_| PostAction::Remove)
        .unwrap();

    c.bench_function("extend_mixed", |b| {
        b.iter(|| {
            timeout.close();

            timeout = event_loop
                .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
                .unwrap();

            event_loop.step().unwrap();
        });
    });
}

fn mixed_multiple(c: &mut Criterion) {
    let event_loop = MainLoop::new().unwrap();

    event_loop.add_idle(|| PostAction::Continue).unwrap();

    for _ in 0..1000 {
        event_loop
            .add_timeout(Duration::from_secs(60 * 10 - 1), |_| PostAction::Remove)
            .unwrap();
    }

    let mut timeout = event_loop
        .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
        .unwrap();

    for _ in 0..1000 {
        event_loop
            .add_timeout(Duration::from_secs(90 * 10), |_| PostAction::Remove)
            .unwrap();
    }

    c.bench_function("extend_mixed_many", |b| {
        b.iter(|| {
            timeout.close();

            timeout = event_loop
                .add_timeout(Duration::from_secs(60 * 10), |_| PostAction::Remove)
                .unwrap();

            event_loop.step().unwrap();
        });
    });
}

criterion_group!(benches, single, mixed, mixed_multiple);
criterion_main!(benches);
