use std::net::Ipv4Addr;
use std::time::SystemTime;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use cbd::machine::{MachineId, MachineName};
use cbd::net::CidrAddr;
use cbd::protocol::messages::WorkerState;
use cbd::scheduler::{Scheduler, SchedulerRequest};

fn make_scheduler(workers: u32) -> Scheduler {
    let mut scheduler = Scheduler::default();
    for i in 0..workers {
        scheduler.add_worker(WorkerState {
            id: MachineId::new(format!("worker-{}", i)),
            host: format!("worker-{}", i),
            addrs: vec![CidrAddr::new(
                Ipv4Addr::new(10, (i >> 8) as u8, i as u8, 1),
                24,
            )],
            port: 15797,
            capacity: 8,
            load: (i % 9) as u32,
            updated: SystemTime::now(),
            speed: f64::from(i),
        });
    }
    scheduler
}

fn requester() -> MachineName {
    MachineName {
        id: MachineId::new("bench-client"),
        host: "bench-client".to_string(),
    }
}

fn bench_schedule(c: &mut Criterion) {
    c.bench_function("schedule_500_workers", |b| {
        b.iter_batched(
            || make_scheduler(500),
            |mut scheduler| {
                let (request, rx) =
                    SchedulerRequest::new(requester(), vec![CidrAddr::new(Ipv4Addr::new(10, 0, 0, 2), 8)]);
                scheduler.schedule(request).unwrap();
                rx
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("queue_drain_100_requests", |b| {
        b.iter_batched(
            || {
                let mut scheduler = make_scheduler(1);
                for _ in 0..100 {
                    let (request, rx) = SchedulerRequest::new(
                        requester(),
                        vec![CidrAddr::new(Ipv4Addr::new(192, 168, 1, 2), 24)],
                    );
                    scheduler.schedule(request).unwrap();
                    drop(rx);
                }
                scheduler
            },
            |mut scheduler| {
                scheduler.update_worker(WorkerState {
                    id: MachineId::new("worker-0"),
                    host: "worker-0".to_string(),
                    addrs: vec![CidrAddr::new(Ipv4Addr::new(192, 168, 1, 1), 24)],
                    port: 15797,
                    capacity: 8,
                    load: 0,
                    updated: SystemTime::now(),
                    speed: 1.0,
                });
                scheduler
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_schedule);
criterion_main!(benches);
