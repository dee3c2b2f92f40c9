use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use shmring_rs::{Queue, QueueConfig};

const MESSAGES: u64 = 100_000;

fn scratch_queue(tag: &str) -> (Queue, String) {
    let name = format!("/shmring-bench-{tag}-{}", std::process::id());
    let _ = Queue::unlink(&name);
    let queue = Queue::create(&name, QueueConfig::new(1024, 64, false)).unwrap();
    (queue, name)
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("push_pop_32b", |b| {
        let (mut queue, name) = scratch_queue("copy");
        let payload = [0x42u8; 32];
        let mut buf = [0u8; 64];

        b.iter(|| {
            for _ in 0..MESSAGES {
                queue.push(&payload).unwrap();
                let len = queue.pop(&mut buf).unwrap();
                black_box(&buf[..len]);
            }
        });

        drop(queue);
        let _ = Queue::unlink(&name);
    });

    group.bench_function("reserve_commit_peek_release_32b", |b| {
        let (mut queue, name) = scratch_queue("zerocopy");

        b.iter(|| {
            for _ in 0..MESSAGES {
                let slot = queue.reserve(32).unwrap();
                slot.fill(0x42);
                queue.commit(32).unwrap();

                black_box(queue.peek().unwrap());
                queue.release().unwrap();
            }
        });

        drop(queue);
        let _ = Queue::unlink(&name);
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
