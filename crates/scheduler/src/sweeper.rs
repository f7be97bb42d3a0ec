//! Expiration sweeper: enforces the time-based transitions of orders and stalls.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Clock;
use serde::Serialize;
use store::{
    OrderPatch, OrderState, Request, RequestPatch, RequestState, ReservationOrder,
    ReservationStore, StoreError,
};

use crate::job::Job;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending orders past their approval deadline, expired by the first pass.
    pub orders_expired: u64,
    /// Occupations past their end, released by the second pass.
    pub occupations_released: u64,
    /// Reserved stalls past `reserved_until` freed by the orphan pass.
    pub orphan_stalls_released: u64,
    /// Overdue pending orders caught by the orphan pass.
    pub orphan_orders_expired: u64,
    /// Requests left behind by their order's expiry or release, settled by
    /// the reconcile pass.
    pub requests_reconciled: u64,
    /// Records that failed to update; they are retried on the next tick.
    pub failures: u64,
}

impl SweepReport {
    /// True if the sweep changed nothing.
    pub fn is_empty(&self) -> bool {
        self.orders_expired == 0
            && self.occupations_released == 0
            && self.orphan_stalls_released == 0
            && self.orphan_orders_expired == 0
            && self.requests_reconciled == 0
    }
}

/// Runs the sweep passes.
///
/// Every write is conditioned on the state the pass expects, so racing with
/// an approval or a rejection is harmless: whichever conditional update lands
/// first wins and the other side skips the record. Within a record the steps
/// run so that an interrupted one is found again next tick, either by the same
/// pass or by the reconcile pass.
#[derive(Clone)]
pub struct ExpirationSweeper<S: ReservationStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: ReservationStore> ExpirationSweeper<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        self.expire_unapproved(now, &mut report).await;
        self.release_finished(now, &mut report).await;
        self.clean_orphans(now, &mut report).await;
        self.reconcile_requests(now, &mut report).await;

        metrics::counter!("sweeper_orders_expired_total")
            .increment(report.orders_expired + report.orphan_orders_expired);
        metrics::counter!("sweeper_occupations_released_total")
            .increment(report.occupations_released);
        metrics::counter!("sweeper_orphan_stalls_released_total")
            .increment(report.orphan_stalls_released);
        metrics::counter!("sweeper_record_failures_total").increment(report.failures);

        if report.is_empty() && report.failures == 0 {
            tracing::debug!("sweep found nothing to do");
        } else {
            tracing::info!(
                orders_expired = report.orders_expired,
                occupations_released = report.occupations_released,
                orphan_stalls_released = report.orphan_stalls_released,
                orphan_orders_expired = report.orphan_orders_expired,
                requests_reconciled = report.requests_reconciled,
                failures = report.failures,
                "sweep finished"
            );
        }
        report
    }

    /// Pass 1: `EN_SOLICITUD` orders past `approve_before` become `VENCIDA`,
    /// their stall is released and their request returns to `Requested`.
    async fn expire_unapproved(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let due = match self.store.orders_due_for_expiry(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "could not list orders due for expiry");
                report.failures += 1;
                return;
            }
        };

        for order in due {
            match self.expire_order(&order, now).await {
                Ok(true) => report.orders_expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(order_id = %order.id, error = %e, "order expiry failed, will retry next tick");
                    report.failures += 1;
                }
            }
        }
    }

    async fn expire_order(&self, order: &ReservationOrder, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self
            .store
            .transition_order(order.id, &[OrderState::Pending], OrderState::Expired, now, OrderPatch::new())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => {
                tracing::debug!(order_id = %order.id, "order moved on before expiry");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        // The order is the gate against a late approval. Once it is expired,
        // the steps below are picked up by the reconcile pass if they fail.
        self.reopen_request(order, now).await?;
        tracing::info!(order_id = %order.id, reference = %order.reference, "order expired");
        Ok(true)
    }

    /// Frees the lapsed reservation of an expired order and puts its request
    /// back to `Requested`.
    async fn reopen_request(&self, order: &ReservationOrder, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if self.store.release_lapsed_reservation(order.stall_id, now).await?.is_none() {
            tracing::debug!(stall_id = %order.stall_id, "stall was no longer reserved");
        }

        match self
            .store
            .transition_request(
                order.request_id,
                Some(&[RequestState::Postulated]),
                RequestState::Requested,
                RequestPatch::new().clear_order(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_state_conflict() => {
                tracing::warn!(request_id = %order.request_id, error = %e, "request of expired order not reverted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize_request(&self, order: &ReservationOrder) -> Result<bool, StoreError> {
        match self
            .store
            .transition_request(
                order.request_id,
                Some(&[RequestState::Approved]),
                RequestState::Finalized,
                RequestPatch::new(),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_state_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pass 2: assigned or occupied orders past their release time or planned
    /// end become `LIBERADA`, the stall is vacated and the request finalized.
    async fn release_finished(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let due = match self.store.orders_due_for_release(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "could not list occupations due for release");
                report.failures += 1;
                return;
            }
        };

        for order in due {
            match self.release_order(&order, now).await {
                Ok(true) => report.occupations_released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(order_id = %order.id, error = %e, "occupation release failed, will retry next tick");
                    report.failures += 1;
                }
            }
        }
    }

    /// Vacates the stall before closing the order, so a failed vacate leaves
    /// the order due and the next tick tries again.
    async fn release_order(&self, order: &ReservationOrder, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let snapshot = order.occupant.occupant(order.start_date, order.end_date);
        let national_id = order.occupant.national_id.as_str();
        if self
            .store
            .vacate(order.stall_id, national_id, now, Some(snapshot))
            .await?
            .is_none()
        {
            tracing::debug!(stall_id = %order.stall_id, "stall already vacated");
        }

        match self
            .store
            .transition_order(order.id, &OrderState::OCCUPYING, OrderState::Released, now, OrderPatch::new())
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_state_conflict() => return Ok(false),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.finalize_request(order).await {
            tracing::warn!(request_id = %order.request_id, error = %e, "request of released order not finalized, will retry next tick");
        }

        tracing::info!(order_id = %order.id, reference = %order.reference, stall_id = %order.stall_id, "occupation released");
        Ok(true)
    }

    /// Pass 3: frees reservations nobody followed up on and expires pending
    /// orders the first pass missed.
    async fn clean_orphans(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        match self.store.release_expired_reservations(now).await {
            Ok(freed) => report.orphan_stalls_released = freed,
            Err(e) => {
                tracing::error!(error = %e, "orphan reservation cleanup failed");
                report.failures += 1;
            }
        }
        match self.store.expire_overdue_orders(now).await {
            Ok(expired) => report.orphan_orders_expired = expired,
            Err(e) => {
                tracing::error!(error = %e, "overdue order cleanup failed");
                report.failures += 1;
            }
        }
    }

    /// Pass 4: settles requests whose order reached its end without them. A
    /// postulated request of an expired order is reopened; an approved
    /// request of a released order is finalized.
    async fn reconcile_requests(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        for state in [RequestState::Postulated, RequestState::Approved] {
            let requests = match self.store.requests_in_state(state).await {
                Ok(requests) => requests,
                Err(e) => {
                    tracing::error!(state = state.as_str(), error = %e, "could not list requests to reconcile");
                    report.failures += 1;
                    continue;
                }
            };
            for request in requests {
                match self.reconcile_request(&request, now).await {
                    Ok(true) => report.requests_reconciled += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(request_id = %request.id, error = %e, "request reconcile failed, will retry next tick");
                        report.failures += 1;
                    }
                }
            }
        }
    }

    async fn reconcile_request(&self, request: &Request, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(order_id) = request.order_id else {
            return Ok(false);
        };
        let Some(order) = self.store.order(order_id).await? else {
            return Ok(false);
        };
        match (request.state, order.state) {
            (RequestState::Postulated, OrderState::Expired) => self.reopen_request(&order, now).await,
            (RequestState::Approved, OrderState::Released) => self.finalize_request(&order).await,
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl<S: ReservationStore> Job for ExpirationSweeper<S> {
    type Output = SweepReport;

    fn name(&self) -> &'static str {
        "sweeper"
    }

    async fn run(&self) -> SweepReport {
        self.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::{ManualClock, MarketId};
    use store::{
        Citizen, FailPoint, InMemoryStore, NewOrder, NewRequest, NewStall, OrderStore, RequestStore,
        StallRegistry, StallState,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap()
    }

    /// Leaves a reserved stall with a pending order and a postulated request.
    async fn pending(store: &InMemoryStore) -> ReservationOrder {
        let stall = NewStall::new("MC-T-010", "Diez", MarketId::new()).into_stall(t0());
        store.insert_stall(stall.clone()).await.unwrap();
        let request = Request::new(
            NewRequest {
                stall_id: stall.id,
                citizen: Citizen::new("Ana", "1712345678"),
                start_date: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
                end_date: Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap(),
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
                sequence: 1,
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
        order
    }

    /// Moves a pending order on to an assigned occupation.
    async fn assigned(store: &InMemoryStore) -> ReservationOrder {
        let order = pending(store).await;
        store
            .transition_order(
                order.id,
                &[OrderState::Pending],
                OrderState::Assigned,
                t0(),
                OrderPatch::new().release_at(order.end_date),
            )
            .await
            .unwrap();
        store
            .assign(order.stall_id, order.occupant.occupant(order.start_date, order.end_date))
            .await
            .unwrap();
        store
            .transition_request(
                order.request_id,
                Some(&[RequestState::Postulated]),
                RequestState::Approved,
                RequestPatch::new(),
            )
            .await
            .unwrap();
        order
    }

    fn sweeper(store: &InMemoryStore, clock: &ManualClock) -> ExpirationSweeper<InMemoryStore> {
        ExpirationSweeper::new(store.clone(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn nothing_due_changes_nothing() {
        let store = InMemoryStore::new();
        let order = pending(&store).await;
        let clock = ManualClock::new(t0() + Duration::hours(1));

        let report = sweeper(&store, &clock).sweep().await;
        assert!(report.is_empty());
        assert_eq!(report.failures, 0);
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Pending);
    }

    #[tokio::test]
    async fn overdue_order_expires_and_request_reopens() {
        let store = InMemoryStore::new();
        let order = pending(&store).await;
        let clock = ManualClock::new(t0() + Duration::hours(25));

        let report = sweeper(&store, &clock).sweep().await;
        assert_eq!(report.orders_expired, 1);
        assert_eq!(report.orphan_orders_expired, 0);
        assert_eq!(report.orphan_stalls_released, 0);

        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Expired);
        assert_eq!(stored.expired_at, Some(clock.now()));
        let stall = store.stall(order.stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
        let request = store.request(order.request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Requested);
        assert!(request.order_id.is_none());
    }

    #[tokio::test]
    async fn finished_occupation_is_released_into_history() {
        let store = InMemoryStore::new();
        let order = assigned(&store).await;

        let clock = ManualClock::new(order.end_date + Duration::minutes(5));
        let report = sweeper(&store, &clock).sweep().await;
        assert_eq!(report.occupations_released, 1);

        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Released);
        let stall = store.stall(order.stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
        assert!(stall.current_occupant.is_none());
        assert_eq!(stall.occupant_history.len(), 1);
        assert_eq!(stall.occupant_history[0].national_id(), "1712345678");
        assert_eq!(stall.occupant_history[0].actual_end, Some(clock.now()));
        let request = store.request(order.request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Finalized);
    }

    #[tokio::test]
    async fn failed_vacate_is_retried_on_next_tick() {
        let store = InMemoryStore::new();
        let order = assigned(&store).await;
        let clock = ManualClock::new(order.end_date + Duration::minutes(5));
        let sweeper = sweeper(&store, &clock);

        store.fail_next(FailPoint::Vacate);
        let report = sweeper.sweep().await;
        assert_eq!(report.occupations_released, 0);
        assert_eq!(report.failures, 1);
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Assigned);
        let stall = store.stall(order.stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Occupied);

        let report = sweeper.sweep().await;
        assert_eq!(report.occupations_released, 1);
        assert_eq!(report.failures, 0);
        let stall = store.stall(order.stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
        assert_eq!(stall.occupant_history.len(), 1);
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Released);
        let request = store.request(order.request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Finalized);
    }

    #[tokio::test]
    async fn unfinalized_request_is_settled_by_reconcile() {
        let store = InMemoryStore::new();
        let order = assigned(&store).await;
        let clock = ManualClock::new(order.end_date + Duration::minutes(5));

        store.fail_next(FailPoint::TransitionRequest);
        let report = sweeper(&store, &clock).sweep().await;
        assert_eq!(report.occupations_released, 1);
        assert_eq!(report.requests_reconciled, 1);
        let request = store.request(order.request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Finalized);
    }

    #[tokio::test]
    async fn failed_request_revert_is_reconciled() {
        let store = InMemoryStore::new();
        let order = pending(&store).await;
        let clock = ManualClock::new(t0() + Duration::hours(25));
        let sweeper = sweeper(&store, &clock);

        store.fail_next(FailPoint::TransitionRequest);
        let report = sweeper.sweep().await;
        // Pass 1 expires the order but fails on the request; pass 4 finishes it.
        assert_eq!(report.orders_expired, 0);
        assert_eq!(report.failures, 1);
        assert_eq!(report.requests_reconciled, 1);
        let stored = store.order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.state, OrderState::Expired);
        let request = store.request(order.request_id).await.unwrap().unwrap();
        assert_eq!(request.state, RequestState::Requested);
        assert!(request.order_id.is_none());
        let stall = store.stall(order.stall_id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);

        assert!(sweeper.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn orphan_reservation_is_freed() {
        let store = InMemoryStore::new();
        let stall = NewStall::new("MC-T-011", "Once", MarketId::new()).into_stall(t0());
        store.insert_stall(stall.clone()).await.unwrap();
        store.try_reserve(stall.id, t0()).await.unwrap();

        let clock = ManualClock::new(t0() + Duration::minutes(1));
        let report = sweeper(&store, &clock).sweep().await;
        assert_eq!(report.orphan_stalls_released, 1);
        let stall = store.stall(stall.id).await.unwrap().unwrap();
        assert_eq!(stall.state, StallState::Free);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let store = InMemoryStore::new();
        pending(&store).await;
        let clock = ManualClock::new(t0() + Duration::hours(25));
        let sweeper = sweeper(&store, &clock);

        assert!(!sweeper.sweep().await.is_empty());
        let before = (store.all_orders().await, store.all_stalls().await);
        let report = sweeper.sweep().await;
        assert!(report.is_empty());
        assert_eq!((store.all_orders().await, store.all_stalls().await), before);
    }
}
