use std::thread;

use bibw_shared::{
    transport::loopback::LoopbackTransport, BenchConfig, Role, RoleOrchestrator, SizeResult,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const ITERATIONS: usize = 16;

pub fn window_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback window");
    for window_depth in [1, 16, 64] {
        for max_msg_log in [8, 14] {
            let config = BenchConfig {
                max_msg_log,
                iterations: ITERATIONS,
                window_depth,
                ..Default::default()
            };

            let bytes: usize = config.schedule().sizes().sum::<usize>() * window_depth * 2;
            group.throughput(Throughput::Bytes((bytes * ITERATIONS) as u64));
            let largest = 1usize << (max_msg_log - 1);
            group.bench_with_input(
                BenchmarkId::new(format!("Window Depth {}", window_depth), largest),
                &config,
                |b, config| b.iter(|| sweep_pair(config)),
            );
        }
    }
}

fn sweep_pair(config: &BenchConfig) -> Vec<SizeResult> {
    let (listener, connector) = LoopbackTransport::pair();

    let connector_config = BenchConfig {
        role: Role::Connector {
            addr: "127.0.0.1:0".parse().unwrap(),
        },
        ..config.clone()
    };

    thread::scope(|s| {
        s.spawn(move || {
            RoleOrchestrator::new(connector_config, connector)
                .run(&mut Vec::new())
                .unwrap()
        });

        let mut results = Vec::new();
        RoleOrchestrator::new(config.clone(), listener)
            .run(&mut results)
            .unwrap();
        results
    })
}

criterion_group!(benches, window_benchmark);
criterion_main!(benches);
