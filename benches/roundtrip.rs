//! Lock-step round-trip latency
//!
//! An echo thread holds the agent endpoint on its own mapping; each
//! iteration is one full round (send, peer receive and reply, receive).
//!
//! Run with: cargo bench --bench roundtrip

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_ipc::{Batch, Endpoint, EndpointConfig, ObjectNames, Role, Side, Single};
use std::thread;
use std::time::Duration;

const BATCH_LENGTHS: &[usize] = &[1, 16, 256];

fn configs(tag: &str) -> (EndpointConfig, EndpointConfig) {
    let names = ObjectNames::default().with_suffix(&format!("bench_{}_{}", tag, std::process::id()));
    let sim = EndpointConfig::new(Role::Creator, Side::Simulation)
        .with_names(names.clone())
        .with_size(1 << 20)
        .with_handle_finish(true);
    let agent = EndpointConfig::new(Role::Attacher, Side::Agent)
        .with_names(names)
        .with_handle_finish(true);
    (sim, agent)
}

fn bench_single_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_roundtrip");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("u64", |b| {
        let (sim_config, agent_config) = configs("single");
        let mut sim = Endpoint::<u64, u64, Single>::new(&sim_config).unwrap();
        let mut agent = Endpoint::<u64, u64, Single>::new(&agent_config).unwrap();
        let echo = thread::spawn(move || {
            while let Some(v) = agent.recv_value().unwrap() {
                agent.send_value(v + 1).unwrap();
            }
        });

        let mut n = 0u64;
        b.iter(|| {
            sim.send_value(black_box(n)).unwrap();
            n = sim.recv_value().unwrap().unwrap();
        });

        drop(sim);
        echo.join().unwrap();
    });

    group.bench_function("record_64B", |b| {
        let (sim_config, agent_config) = configs("record");
        let mut sim = Endpoint::<[u64; 8], [u64; 8], Single>::new(&sim_config).unwrap();
        let mut agent = Endpoint::<[u64; 8], [u64; 8], Single>::new(&agent_config).unwrap();
        let echo = thread::spawn(move || {
            while let Some(v) = agent.recv_value().unwrap() {
                agent.send_value(v).unwrap();
            }
        });

        let payload = [7u64; 8];
        b.iter(|| {
            sim.send_value(black_box(payload)).unwrap();
            black_box(sim.recv_value().unwrap());
        });

        drop(sim);
        echo.join().unwrap();
    });

    group.finish();
}

fn bench_batch_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_roundtrip");
    group.measurement_time(Duration::from_secs(5));

    for &len in BATCH_LENGTHS {
        group.bench_with_input(BenchmarkId::new("f64", len), &len, |b, &len| {
            let (sim_config, agent_config) = configs(&format!("batch{}", len));
            let mut sim = Endpoint::<f64, f64, Batch>::new(&sim_config).unwrap();
            let mut agent = Endpoint::<f64, f64, Batch>::new(&agent_config).unwrap();
            let echo = thread::spawn(move || {
                while let Some(values) = agent.recv_vec().unwrap() {
                    agent.send_slice(&values).unwrap();
                }
            });

            let payload = vec![1.5f64; len];
            b.iter(|| {
                sim.send_slice(black_box(&payload)).unwrap();
                black_box(sim.recv().unwrap().unwrap().len());
            });

            drop(sim);
            echo.join().unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_roundtrip, bench_batch_roundtrip);
criterion_main!(benches);
