use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{ManualClock, MarketId};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use scheduler::ExpirationSweeper;
use store::{
    Citizen, InMemoryStore, NewOrder, NewRequest, NewStall, OrderStore, Request, RequestPatch,
    RequestState, RequestStore, ReservationOrder, StallRegistry,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap()
}

/// N reserved stalls, each with a pending order and a postulated request.
async fn populate(n: u64) -> InMemoryStore {
    let store = InMemoryStore::new();
    for i in 1..=n {
        let stall = NewStall::new(format!("MC-T-{i:05}"), "Puesto", MarketId::new()).into_stall(t0());
        store.insert_stall(stall.clone()).await.unwrap();
        let request = Request::new(
            NewRequest {
                stall_id: stall.id,
                citizen: Citizen::new("Ana", format!("{:010}", i)),
                start_date: t0(),
                end_date: t0() + Duration::days(10),
                manual: true,
                operator: None,
            },
            &stall,
            t0(),
        );
        store.insert_request(request.clone()).await.unwrap();
        store.try_reserve(stall.id, t0() + Duration::hours(24)).await.unwrap();
        let order = ReservationOrder::new(
            NewOrder {
                sequence: i,
                stall_id: stall.id,
                request_id: request.id,
                market_id: stall.market_id,
                section: None,
                start_date: request.start_date,
                end_date: request.end_date,
                occupant: request.citizen.clone(),
                external_payment: None,
                manual: true,
                operator: None,
            },
            t0(),
            Duration::hours(24),
        );
        store.insert_order(order.clone()).await.unwrap();
        store
            .transition_request(
                request.id,
                Some(&[RequestState::Requested]),
                RequestState::Postulated,
                RequestPatch::new().link_order(order.id),
            )
            .await
            .unwrap();
    }
    store
}

fn bench_sweep_1000_expired(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let clock = ManualClock::new(t0() + Duration::hours(25));

    c.bench_function("sweeper/sweep_1000_expired", |b| {
        b.iter_batched(
            || rt.block_on(populate(1000)),
            |store| {
                rt.block_on(async {
                    let sweeper = ExpirationSweeper::new(store, Arc::new(clock.clone()));
                    let report = sweeper.sweep().await;
                    assert_eq!(report.orders_expired, 1000);
                });
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_sweep_1000_nothing_due(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(populate(1000));
    let sweeper = ExpirationSweeper::new(store, Arc::new(ManualClock::new(t0())));

    c.bench_function("sweeper/sweep_1000_nothing_due", |b| {
        b.iter(|| {
            rt.block_on(async {
                let report = sweeper.sweep().await;
                assert!(report.is_empty());
            });
        });
    });
}

criterion_group!(benches, bench_sweep_1000_expired, bench_sweep_1000_nothing_due);
criterion_main!(benches);
