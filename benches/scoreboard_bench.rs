use criterion::{black_box, criterion_group, criterion_main, Criterion};
use proc_prefork::{
    AdmissionConfig, AdmissionGate, Config, RequestInfo, Scoreboard, Watchdog, WorkerStatus,
    HARD_WORKER_LIMIT,
};
use std::time::Duration;

fn populated_board() -> Scoreboard {
    let board = Scoreboard::new(HARD_WORKER_LIMIT).unwrap();
    for slot in 0..HARD_WORKER_LIMIT / 2 {
        board.claim(slot, slot as u64 + 1).unwrap();
        let status = if slot % 3 == 0 {
            WorkerStatus::BusyWrite
        } else {
            WorkerStatus::Ready
        };
        board.update(slot, status, None).unwrap();
    }
    board
}

fn bench_status_update(c: &mut Criterion) {
    let board = Scoreboard::new(HARD_WORKER_LIMIT).unwrap();
    board.claim(0, 1).unwrap();
    let info = RequestInfo::new("127.0.0.1:40000", "GET /index.html HTTP/1.1", "localhost");

    c.bench_function("status_update", |b| {
        b.iter(|| {
            board
                .update(0, WorkerStatus::BusyWrite, Some(black_box(&info)))
                .unwrap();
            board.update(0, WorkerStatus::Ready, None).unwrap();
        });
    });
}

fn bench_request_accounting(c: &mut Criterion) {
    let board = Scoreboard::new(HARD_WORKER_LIMIT).unwrap();
    board.claim(0, 1).unwrap();

    c.bench_function("request_accounting", |b| {
        b.iter(|| board.increment(0, black_box(1024)).unwrap());
    });
}

fn bench_idle_scan(c: &mut Criterion) {
    let board = populated_board();

    c.bench_function("idle_scan", |b| {
        b.iter(|| black_box(board.idle_scan(HARD_WORKER_LIMIT)));
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let board = populated_board();

    c.bench_function("snapshot", |b| {
        b.iter(|| black_box(board.snapshot()));
    });
}

fn bench_watchdog_arm(c: &mut Criterion) {
    let watchdog = Watchdog::new();

    c.bench_function("watchdog_arm_disarm", |b| {
        b.iter(|| {
            watchdog.hard_timeout("send body", Duration::from_secs(300));
            watchdog.disarm();
        });
    });
}

fn bench_gate_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let gate = AdmissionGate::new(&AdmissionConfig::default()).unwrap();

    c.bench_function("gate_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let permit = gate.acquire().await;
                permit.release();
            });
        });
    });
}

fn bench_config_building(c: &mut Criterion) {
    c.bench_function("config_building", |b| {
        b.iter(|| {
            let config = Config::builder()
                .name("bench-server")
                .worker_limit(64)
                .idle_workers(4, 8)
                .request_timeout(Duration::from_secs(30))
                .unwrap()
                .build()
                .unwrap();
            black_box(config);
        });
    });
}

criterion_group!(
    benches,
    bench_status_update,
    bench_request_accounting,
    bench_idle_scan,
    bench_snapshot,
    bench_watchdog_arm,
    bench_gate_cycle,
    bench_config_building
);
criterion_main!(benches);
