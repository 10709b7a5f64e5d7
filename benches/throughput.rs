use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft::prelude::*;

const THREAD_COUNTS: [usize; 3] = [1, 2, 4];

fn scheduler(thread_count: usize) -> Scheduler {
    let scheduler = Scheduler::new(SchedulerConfig::default().with_thread_count(thread_count))
        .expect("failed to create scheduler");
    scheduler.prepare_to_run_jobs();
    scheduler
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for tasks in [64_usize, 1024] {
        group.throughput(Throughput::Elements(tasks as u64));
        for thread_count in THREAD_COUNTS {
            let scheduler = scheduler(thread_count);
            group.bench_with_input(
                BenchmarkId::new(format!("{thread_count}_threads"), tasks),
                &tasks,
                |b, &tasks| {
                    b.iter(|| {
                        let mut tasks_group = scheduler.group();
                        for i in 0..tasks {
                            tasks_group.spawn(async move { black_box(i) * 2 });
                        }
                        tasks_group.wait_for_completion();
                        tasks_group.into_results()
                    });
                },
            );
            scheduler.stop_running_jobs();
        }
    }

    group.finish();
}

fn bench_await_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("await_chain");

    for thread_count in THREAD_COUNTS {
        let scheduler = scheduler(thread_count);
        group.bench_function(BenchmarkId::new("depth_16", thread_count), |b| {
            b.iter(|| {
                let handle = scheduler.handle().clone();
                scheduler.block_on(async move {
                    let mut total = 0_usize;
                    for i in 0..16 {
                        total += handle.start(async move { black_box(i) }).await;
                    }
                    total
                })
            });
        });
        scheduler.stop_running_jobs();
    }

    group.finish();
}

fn bench_main_thread(c: &mut Criterion) {
    let scheduler = scheduler(4);

    c.bench_function("main_thread_round_trip", |b| {
        b.iter(|| {
            let mut group = scheduler.group();
            for i in 0..64_usize {
                group.spawn_on_main_thread(async move { black_box(i) });
            }
            group.wait_for_completion();
            group.len()
        });
    });

    scheduler.stop_running_jobs();
}

criterion_group!(benches, bench_fan_out, bench_await_chain, bench_main_thread);
criterion_main!(benches);
