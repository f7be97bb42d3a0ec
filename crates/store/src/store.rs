use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, RequestId, StallId};

use crate::{
    ExternalPayment, Occupant, OrderPatch, OrderReference, OrderState, Request, RequestPatch,
    RequestState, ReservationOrder, Result, Stall,
};

/// Owns a stall's occupancy state and occupant history.
///
/// Every mutation is a single-document conditional update: the precondition
/// is checked and the write applied atomically, never as a separate
/// read-then-write. A failed precondition returns
/// [`StoreError::StateConflict`](crate::StoreError::StateConflict) and writes
/// nothing.
#[async_trait]
pub trait StallRegistry: Send + Sync {
    /// Adds a stall to the registry (catalog-side creation).
    async fn insert_stall(&self, stall: Stall) -> Result<()>;

    async fn stall(&self, id: StallId) -> Result<Option<Stall>>;

    /// Finds the stall whose code ends with `T-{code}`, ignoring case.
    async fn stall_by_external_code(&self, code: &str) -> Result<Option<Stall>>;

    /// Free → Reserved with `reserved_until = until`.
    ///
    /// This is the sole mutual-exclusion point of the system: of any number
    /// of concurrent callers at most one succeeds.
    async fn try_reserve(&self, id: StallId, until: DateTime<Utc>) -> Result<Stall>;

    /// Reserved | Free → Occupied, clearing `reserved_until`.
    async fn occupy(&self, id: StallId) -> Result<Stall>;

    /// Same precondition as [`occupy`](Self::occupy), also writing the
    /// current occupant in the same update.
    async fn assign(&self, id: StallId, occupant: Occupant) -> Result<Stall>;

    /// Any state → Free, clearing `reserved_until`.
    async fn release(&self, id: StallId) -> Result<Stall>;

    /// Reserved → Free. Returns `None` (and writes nothing) when the stall is
    /// not reserved.
    async fn release_reservation(&self, id: StallId) -> Result<Option<Stall>>;

    /// Overwrites the current occupant.
    async fn set_occupant(&self, id: StallId, occupant: Occupant) -> Result<Stall>;

    /// Moves the current occupant, closed at `actual_end`, into the history.
    /// Returns the closed record, or `None` if there was no current occupant.
    async fn close_occupant(&self, id: StallId, actual_end: DateTime<Utc>)
    -> Result<Option<Occupant>>;

    /// Ends the occupation held by `national_id` in one update: closes the
    /// current occupant into the history (or appends `fallback` when there
    /// is none), clears it and frees the stall.
    ///
    /// Applies only while the stall is Occupied and its current occupant, if
    /// any, is that citizen. Otherwise returns `None` and writes nothing, so
    /// repeating a vacate never touches a later occupation.
    async fn vacate(
        &self,
        id: StallId,
        national_id: &str,
        actual_end: DateTime<Utc>,
        fallback: Option<Occupant>,
    ) -> Result<Option<Stall>>;

    /// Reserved → Free, only if `reserved_until <= now`. Returns `None` (and
    /// writes nothing) otherwise, so a newer reservation is never freed.
    async fn release_lapsed_reservation(&self, id: StallId, now: DateTime<Utc>)
    -> Result<Option<Stall>>;

    /// Frees every stall reserved with `reserved_until <= now`.
    /// Returns the number of stalls freed.
    async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<u64>;

    /// True if a reserved or occupied stall has this citizen as occupant.
    async fn has_claim_for_citizen(&self, national_id: &str) -> Result<bool>;
}

/// Owns citizens' stall requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: Request) -> Result<()>;

    async fn request(&self, id: RequestId) -> Result<Option<Request>>;

    /// True if the citizen has a request in a blocking state, ignoring `except`.
    async fn has_blocking_request_for_citizen(
        &self,
        national_id: &str,
        except: Option<RequestId>,
    ) -> Result<bool>;

    /// True if the stall is referenced by a request in a blocking state.
    async fn has_blocking_request_for_stall(&self, stall_id: StallId) -> Result<bool>;

    /// Moves a request to `to`, writing `patch` in the same update.
    ///
    /// With `from = Some(states)` the update only applies if the current
    /// state is one of them.
    async fn transition_request(
        &self,
        id: RequestId,
        from: Option<&[RequestState]>,
        to: RequestState,
        patch: RequestPatch,
    ) -> Result<Request>;

    /// Every request currently in `state`, oldest first.
    async fn requests_in_state(&self, state: RequestState) -> Result<Vec<Request>>;
}

/// Owns reservation orders.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Reads the highest sequence in use and returns the next one.
    ///
    /// Best effort only: concurrent callers may get the same value. The
    /// unique reference enforced by [`insert_order`](Self::insert_order) is
    /// what prevents duplicates.
    async fn next_sequence(&self) -> Result<u64>;

    /// Inserts an order; fails with `DuplicateReference` if its reference
    /// is taken.
    async fn insert_order(&self, order: ReservationOrder) -> Result<()>;

    async fn order(&self, id: OrderId) -> Result<Option<ReservationOrder>>;

    async fn order_by_reference(&self, reference: &OrderReference)
    -> Result<Option<ReservationOrder>>;

    /// Conditional state change: applies only if the current state is in
    /// `from`. The timestamp belonging to `to` is stamped with `at`.
    async fn transition_order(
        &self,
        id: OrderId,
        from: &[OrderState],
        to: OrderState,
        at: DateTime<Utc>,
        patch: OrderPatch,
    ) -> Result<ReservationOrder>;

    /// Replaces the payment envelope without touching the state.
    async fn set_payment(&self, id: OrderId, payment: ExternalPayment) -> Result<ReservationOrder>;

    /// Pending orders whose approval deadline is `<= now`.
    async fn orders_due_for_expiry(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>>;

    /// Assigned/occupied orders whose release time or planned end is `<= now`.
    async fn orders_due_for_release(&self, now: DateTime<Utc>) -> Result<Vec<ReservationOrder>>;

    /// Bulk Pending → Expired for every order past its approval deadline.
    /// Returns the number of orders changed.
    async fn expire_overdue_orders(&self, now: DateTime<Utc>) -> Result<u64>;

    /// True if the citizen has an order in an active state.
    async fn has_active_order_for_citizen(&self, national_id: &str) -> Result<bool>;

    /// The pending order of this citizen on this stall, if any.
    async fn pending_order_for(
        &self,
        national_id: &str,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>>;

    /// Most recently created pending order for a stall.
    async fn latest_pending_order_for_stall(
        &self,
        stall_id: StallId,
    ) -> Result<Option<ReservationOrder>>;
}

/// All three stores behind one handle.
pub trait ReservationStore: StallRegistry + RequestStore + OrderStore + Clone + 'static {}

impl<T> ReservationStore for T where T: StallRegistry + RequestStore + OrderStore + Clone + 'static {}
