use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, OrderId, RequestId, StallId, SystemClock};
use tokio::sync::RwLock;

use crate::{
    ExternalPayment, Occupant, OrderPatch, OrderReference, OrderState, Request, RequestPatch,
    RequestState, ReservationOrder, Result, Stall, StallState, StoreError,
    store::{OrderStore, RequestStore, StallRegistry},
};

/// Store calls that can be made to fail once, for testing partial failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Vacate,
    SetPayment,
    TransitionRequest,
    TransitionOrder,
}

/// In-memory implementation of all three stores.
///
/// Each collection sits behind its own lock; every conditional update checks
/// and writes while holding the write lock, which gives the same
/// single-document atomicity as the PostgreSQL implementation. Clones share
/// the same data.
#[derive(Clone)]
pub struct InMemoryStore {
    stalls: Arc<RwLock<HashMap<StallId, Stall>>>,
    requests: Arc<RwLock<HashMap<RequestId, Request>>>,
    orders: Arc<RwLock<HashMap<OrderId, ReservationOrder>>>,
    clock: Arc<dyn Clock>,
    armed: Arc<std::sync::RwLock<HashSet<FailPoint>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryStore {
    /// Creates a new empty store stamping `updated_at` with the wall clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty store stamping `updated_at` with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            stalls: Arc::default(),
            requests: Arc::default(),
            orders: Arc::default(),
            clock,
            armed: Arc::default(),
        }
    }

    /// Makes the next call to `point` fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, point: FailPoint) {
        self.armed.write().unwrap().insert(point);
    }

    fn trip(&self, point: FailPoint) -> Result<()> {
        if self.armed.write().unwrap().remove(&point) {
            return Err(StoreError::Unavailable(format!("{point:?} failed")));
        }
        Ok(())
    }

    pub async fn stall_count(&self) -> usize {
        self.stalls.read().await.len()
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Snapshot of every order, sorted by sequence.
    pub async fn all_orders(&self) -> Vec<ReservationOrder> {
        let mut orders: Vec<_> = self.orders.read().await.values().cloned().collect();
        orders.sort_by_key(|o| o.sequence);
        orders
    }

    /// Snapshot of every stall.
    pub async fn all_stalls(&self) -> Vec<Stall> {
        self.stalls.read().await.values().cloned().collect()
    }

    /// Clears all collections.
    pub async fn clear(&self) {
        self.stalls.write().await.clear();
        self.requests.write().await.clear();
        self.orders.write().await.clear();
    }

    /// Applies `update` to the stall if its state is in `from`.
    async fn update_stall_if<F>(&self, id: StallId, from: &[StallState], update: F) -> Result<Stall>
    where
        F: FnOnce(&mut Stall),
    {
        let mut stalls = self.stalls.write().await;
        let stall = stalls
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Stall", id))?;
        if !from.contains(&stall.state) {
            return Err(StoreError::state_conflict("Stall", id, from, stall.state));
        }
        update(stall);
        stall.updated_at = self.clock.now();
        Ok(stall.clone())
    }
}

fn free(stall: &mut Stall) {
    stall.state = StallState::Free;
    stall.reserved_until = None;
}

const ANY_STALL_STATE: [StallState; 3] =
    [StallState::Free, StallState::Reserved, StallState::Occupied];

#[async_trait]
impl StallRegistry for InMemoryStore {
    async fn insert_stall(&self, stall: Stall) -> Result<()> {
        self.stalls.write().await.insert(stall.id, stall);
        Ok(())
    }

    async fn stall(&self, id: StallId) -> Result<Option<Stall>> {
        Ok(self.stalls.read().await.get(&id).cloned())
    }

    async fn stall_by_external_code(&self, code: &str) -> Result<Option<Stall>> {
        Ok(self
            .stalls
            .read()
            .await
            .values()
            .find(|s| s.matches_external_code(code))
            .cloned())
    }

    async fn try_reserve(&self, id: StallId, until: DateTime<Utc>) -> Result<Stall> {
        self.update_stall_if(id, &[StallState::Free], |stall| {
            stall.state = StallState::Reserved;
            stall.reserved_until = Some(until);
        })
        .await
    }

    async fn occupy(&self, id: StallId) -> Result<Stall> {
        self.update_stall_if(id, &StallState::OCCUPIABLE, |stall| {
            stall.state = StallState::Occupied;
            stall.reserved_until = None;
        })
        .await
    }

    async fn assign(&self, id: StallId, occupant: Occupant) -> Result<Stall> {
        self.update_stall_if(id, &StallState::OCCUPIABLE, |stall| {
            stall.state = StallState::Occupied;
            stall.reserved_until = None;
            stall.current_occupant = Some(occupant);
        })
        .await
    }

    async fn release(&self, id: StallId) -> Result<Stall> {
        self.update_stall_if(id, &ANY_STALL_STATE, free).await
    }

    async fn release_reservation(&self, id: StallId) -> Result<Option<Stall>> {
        match self.update_stall_if(id, &[StallState::Reserved], free).await {
            Ok(stall) => Ok(Some(stall)),
            Err(e) if e.is_state_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_occupant(&self, id: StallId, occupant: Occupant) -> Result<Stall> {
        self.update_stall_if(id, &ANY_STALL_STATE, |stall| {
            stall.current_occupant = Some(occupant);
        })
        .await
    }

    async fn close_occupant(
        &self,
        id: StallId,
        actual_end: DateTime<Utc>,
    ) -> Result<Option<Occupant>> {
        let mut stalls = self.stalls.write().await;
        let stall = stalls
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Stall", id))?;
        let Some(current) = stall.current_occupant.take() else {
            return Ok(None);
        };
        let closed = current.closed(actual_end);
        stall.occupant_history.push(closed.clone());
        stall.updated_at = self.clock.now();
        Ok(Some(closed))
    }

    async fn vacate(
        &self,
        id: StallId,
        national_id: &str,
        actual_end: DateTime<Utc>,
        fallback: Option<Occupant>,
    ) -> Result<Option<Stall>> {
        self.trip(FailPoint::Vacate)?;
        let mut stalls = self.stalls.write().await;
        let stall = stalls
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Stall", id))?;
        if !stall.is_held_by(national_id) {
            return Ok(None);
        }
        if let Some(record) = stall.current_occupant.take().or(fallback) {
            stall.occupant_history.push(record.closed(actual_end));
        }
        free(stall);
        stall.updated_at = self.clock.now();
        Ok(Some(stall.clone()))
    }

    async fn release_lapsed_reservation(
        &self,
        id: StallId,
        now: DateTime<Utc>,
    ) -> Result<Option<Stall>> {
        let mut stalls = self.stalls.write().await;
        let stall = stalls
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Stall", id))?;
        if !stall.reservation_lapsed(now) {
            return Ok(None);
        }
        free(stall);
        stall.updated_at = self.clock.now();
        Ok(Some(stall.clone()))
    }

    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut stalls = self.stalls.write().await;
        let mut freed = 0;
        for stall in stalls.values_mut().filter(|s| s.reservation_lapsed(now)) {
            free(stall);
            stall.updated_at = self.clock.now();
            freed += 1;
        }
        Ok(freed)
    }

    async fn has_claim_for_citizen(&self, national_id: &str) -> Result<bool> {
        Ok(self.stalls.read().await.values().any(|s| {
            s.state.is_claimed()
                && s
                    .current_occupant
                    .as_ref()
                    .is_some_and(|o| o.national_id() == national_id)
        }))
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn insert_request(&self, request: Request) -> Result<()> {
        self.requests.write().await.insert(request.id, request);
        Ok(())
    }

    async fn request(&self, id: RequestId) -> Result<Option<Request>> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn has_blocking_request_for_citizen(
        &self,
        national_id: &str,
        except: Option<RequestId>,
    ) -> Result<bool> {
        Ok(self.requests.read().await.values().any(|r| {
            Some(r.id) != except
                && r.citizen.national_id == national_id
                && r.state.is_blocking()
        }))
    }

    async fn has_blocking_request_for_stall(&self, stall_id: StallId) -> Result<bool> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .any(|r| r.stall_id == stall_id && r.state.is_blocking()))
    }

    async fn transition_request(
        &self,
        id: RequestId,
        from: Option<&[RequestState]>,
        to: RequestState,
        patch: RequestPatch,
    ) -> Result<Request> {
        self.trip(FailPoint::TransitionRequest)?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Request", id))?;
        if let Some(from) = from {
            if !from.contains(&request.state) {
                return Err(StoreError::state_conflict("Request", id, from, request.state));
            }
        }
        request.state = to;
        patch.apply(request);
        request.updated_at = self.clock.now();
        Ok(request.clone())
    }

    async fn requests_in_state(&self, state: RequestState) -> Result<Vec<Request>> {
        let mut found: Vec<_> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn next_sequence(&self) -> Result<u64> {
        let orders = self.orders.read().await;
        Ok(orders.values().map(|o| o.sequence).max().unwrap_or(0) + 1)
    }

    async fn insert_order(&self, order: ReservationOrder) -> Result<()> {
        let mut orders = self.orders.write().await;
        // Unique index on the reference.
        if orders.values().any(|o| o.reference == order.reference) {
            return Err(StoreError::DuplicateReference(order.reference.to_string()));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    async fn order(&self, id: OrderId) -> Result<Option<ReservationOrder>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn order_by_reference(
        &self,
        reference: &OrderReference,
    ) -> Result<Option<ReservationOrder>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .find(|o| &o.reference == reference)
            .cloned())
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: &[OrderState],
        to: OrderState,
        at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<ReservationOrder> {
        self.trip(FailPoint::TransitionOrder)?;
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Order", id))?;
        if !from.contains(&order.state) {
            return Err(StoreError::state_conflict("Order", id, from, order.state));
        }
        order.state = to;
        order.stamp(to, at);
        patch.apply(order);
        order.updated_at = at;
        Ok(order.clone())
    }

    async fn set_payment(&self, id: OrderId, payment: ExternalPayment) -> Result<ReservationOrder> {
        self.trip(FailPoint::SetPayment)?;
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Order", id))?;
        order.external_payment = Some(payment);
        order.updated_at = self.clock.now();
        Ok(order.clone())
    }

    async fn orders_due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>> {
        let mut due: Vec<_> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.is_due_for_expiry(now))
            .cloned()
            .collect();
        due.sort_by_key(|o| o.sequence);
        Ok(due)
    }

    async fn orders_due_for_release(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>> {
        let mut due: Vec<_> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.is_due_for_release(now))
            .cloned()
            .collect();
        due.sort_by_key(|o| o.sequence);
        Ok(due)
    }

    async fn expire_overdue_orders(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut orders = self.orders.write().await;
        let mut expired = 0;
        for order in orders.values_mut().filter(|o| o.is_due_for_expiry(now)) {
            order.state = OrderState::Expired;
            order.stamp(OrderState::Expired, now);
            order.updated_at = now;
            expired += 1;
        }
        Ok(expired)
    }

    async fn has_active_order_for_citizen(&self, national_id: &str) -> Result<bool> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .any(|o| o.occupant.national_id == national_id && o.state.is_active()))
    }

    async fn pending_order_for(
        &self,
        national_id: &str,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .filter(|o| {
                o.state == OrderState::Pending
                    && o.stall_id == stall_id
                    && o.occupant.national_id == national_id
            })
            .max_by_key(|o| (o.created_at, o.sequence))
            .cloned())
    }

    async fn latest_pending_order_for_stall(
        &self,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>> {
        Ok(self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.state == OrderState::Pending && o.stall_id == stall_id)
            .max_by_key(|o| (o.created_at, o.sequence))
            .cloned())
    }
}
