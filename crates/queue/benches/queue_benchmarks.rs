use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use taskflow_core::ManualClock;
use taskflow_queue::{
    BackoffPolicy, HandlerOutcome, InMemoryPriorityQueue, Payload, PriorityQueueStore,
    QueueBackends, QueueConfig, QueueManager, TaskId, TaskPriority, TaskRecord,
};

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue_push_pop");

    for size in [100usize, 1_000, 10_000] {
        let ids: Vec<TaskId> = (0..size).map(|_| TaskId::new()).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            b.iter(|| {
                let queue = InMemoryPriorityQueue::new();
                for (i, id) in ids.iter().enumerate() {
                    queue.push(TaskPriority::DESCENDING[i % 4], *id).unwrap();
                }
                while let Some(popped) = queue.pop().unwrap() {
                    black_box(popped);
                }
            });
        });
    }

    group.finish();
}

fn bench_submit_and_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_manager");
    group.throughput(Throughput::Elements(100));

    group.bench_function("submit_and_drain_100", |b| {
        b.iter(|| {
            let config = QueueConfig {
                backoff: BackoffPolicy::immediate(),
                ..QueueConfig::default()
            };
            let queue = QueueManager::new(
                QueueBackends::in_memory(),
                config,
                Arc::new(ManualClock::at_millis(0)),
            );
            queue.register_handler("noop", |task: &TaskRecord| {
                HandlerOutcome::success(task.payload.clone())
            });
            for _ in 0..100 {
                queue
                    .submit("noop", Payload::new(), None, TaskPriority::Normal)
                    .unwrap();
            }
            black_box(queue.executor(None).drain().unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_submit_and_execute);
criterion_main!(benches);
