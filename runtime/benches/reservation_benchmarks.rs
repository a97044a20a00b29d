//! Reservation throughput benchmarks.
//!
//! Compares reserve/release cycles on disjoint seats against cycles where every task
//! fights over the same seat, plus the pure transition function on its own.
//!
//! Run with: `cargo bench --bench reservation_benchmarks`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::Duration as ChronoDuration;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use seatkeeper_core::environment::{Clock, SystemClock};
use seatkeeper_core::transition::{apply, UnitCommand};
use seatkeeper_core::types::{CustomerId, InventoryUnit, Money, UnitId};
use seatkeeper_runtime::{EngineSettings, ReservationEngine};
use seatkeeper_testing::{fixtures, test_clock, InMemoryInventoryStore};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn engine_with_seats(runtime: &tokio::runtime::Runtime, count: u32) -> (ReservationEngine, Vec<UnitId>) {
    let store = Arc::new(InMemoryInventoryStore::new());
    let seats = runtime
        .block_on(fixtures::seed_section(store.as_ref(), "Bench", 1, count, Money::from_cents(1_000)))
        .expect("Failed to seed section");
    let engine = ReservationEngine::new(store, Arc::new(SystemClock), EngineSettings::default());
    (engine, seats)
}

/// Pure state machine cost
fn benchmark_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    group.throughput(Throughput::Elements(1));

    let now = test_clock().now();
    let holder = CustomerId::new();
    let reserve = UnitCommand::Reserve {
        holder,
        until: now + ChronoDuration::minutes(10),
    };

    group.bench_function("reserve_then_release", |b| {
        let mut unit = InventoryUnit::available(UnitId::new(), "Bench", "A-1", Money::from_cents(1_000));
        b.iter(|| {
            let _ = black_box(apply(&mut unit, &reserve, now));
            let _ = black_box(apply(&mut unit, &UnitCommand::Release, now));
        });
    });

    group.finish();
}

/// `tasks` requesters each reserving and releasing in a loop
fn benchmark_reservations(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservations");
    let runtime = runtime();

    for tasks in &[1usize, 8, 32] {
        group.throughput(Throughput::Elements(*tasks as u64));

        group.bench_with_input(BenchmarkId::new("uncontended", tasks), tasks, |b, &tasks| {
            let (engine, seats) = engine_with_seats(&runtime, u32::try_from(tasks).unwrap_or(1));
            b.to_async(&runtime).iter(|| {
                let engine = engine.clone();
                let seats = seats.clone();
                async move {
                    let cycles = seats.iter().map(|seat| {
                        let engine = engine.clone();
                        async move {
                            let requester = CustomerId::new();
                            let _ = engine.reserve_seats(requester, &[*seat], None).await;
                            engine.release_seats(requester, &[*seat]).await;
                        }
                    });
                    join_all(cycles).await;
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("contended", tasks), tasks, |b, &tasks| {
            let (engine, seats) = engine_with_seats(&runtime, 1);
            let seat = seats[0];
            b.to_async(&runtime).iter(|| {
                let engine = engine.clone();
                async move {
                    let cycles = (0..tasks).map(|_| {
                        let engine = engine.clone();
                        async move {
                            let requester = CustomerId::new();
                            let _ = engine.reserve_seats(requester, &[seat], None).await;
                            engine.release_seats(requester, &[seat]).await;
                        }
                    });
                    join_all(cycles).await;
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_transition, benchmark_reservations);
criterion_main!(benches);
